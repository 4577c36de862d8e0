use serde::{Deserialize, Serialize};

use crate::result::{DmResult, DmShapeErr};

/// half open index range along one dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DimRange {
    pub begin: usize,
    pub end: usize,
}

impl DimRange {
    pub fn new(begin: usize, end: usize) -> Self {
        assert!(begin <= end, "range begin {} > end {}", begin, end);
        Self { begin, end }
    }
    pub fn whole(len: usize) -> Self {
        Self { begin: 0, end: len }
    }
    pub fn len(&self) -> usize {
        self.end - self.begin
    }
    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }
    /// other nests fully inside self
    pub fn contains(&self, other: &DimRange) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }
    pub fn intersect(&self, other: &DimRange) -> DimRange {
        let begin = self.begin.max(other.begin);
        let end = self.end.min(other.end);
        if begin >= end {
            DimRange { begin: 0, end: 0 }
        } else {
            DimRange { begin, end }
        }
    }
}

/// region = one DimRange per dimension, begin/end in the coordinate
/// system of whatever the region is declared against
pub fn region_of_shape(shape: &[usize]) -> Vec<DimRange> {
    shape.iter().map(|&len| DimRange::whole(len)).collect()
}

pub fn region_shape(region: &[DimRange]) -> Vec<usize> {
    region.iter().map(|r| r.len()).collect()
}

pub fn region_len(region: &[DimRange]) -> usize {
    region.iter().map(|r| r.len()).product()
}

pub fn region_is_empty(region: &[DimRange]) -> bool {
    region.iter().any(|r| r.is_empty())
}

pub fn region_intersect(a: &[DimRange], b: &[DimRange]) -> Vec<DimRange> {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x.intersect(y)).collect()
}

pub fn region_nested_in(inner: &[DimRange], outer: &[DimRange]) -> bool {
    assert_eq!(inner.len(), outer.len());
    inner.iter().zip(outer.iter()).all(|(i, o)| o.contains(i))
}

/// global coords -> coords relative to origin's begin
pub fn region_to_relative(region: &[DimRange], origin: &[DimRange]) -> Vec<DimRange> {
    assert_eq!(region.len(), origin.len());
    region
        .iter()
        .zip(origin.iter())
        .map(|(r, o)| DimRange::new(r.begin - o.begin, r.end - o.begin))
        .collect()
}

/// coords relative to origin's begin -> global coords
pub fn region_from_relative(region: &[DimRange], origin: &[DimRange]) -> Vec<DimRange> {
    assert_eq!(region.len(), origin.len());
    region
        .iter()
        .zip(origin.iter())
        .map(|(r, o)| DimRange::new(r.begin + o.begin, r.end + o.begin))
        .collect()
}

/// row major contiguous strides
pub fn strides_of(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    let mut cum = 1;
    for (i, &len) in shape.iter().enumerate().rev() {
        strides[i] = cum;
        cum *= len;
    }
    strides
}

pub fn shape_len(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// broadcast unification over any number of operand shapes,
/// dimensions aligned from the trailing end, missing dims count as 1;
/// per dim the unified size is the max, every declared size must be 1
/// or equal to that max
pub fn unify_shapes(shapes: &[&[usize]]) -> DmResult<Vec<usize>> {
    let out_ndim = shapes.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut unified = vec![1usize; out_ndim];
    for i in 0..out_ndim {
        let mut max = 1usize;
        for s in shapes {
            let size = if i < s.len() { s[s.len() - 1 - i] } else { 1 };
            if size > max {
                max = size;
            }
        }
        for s in shapes {
            let size = if i < s.len() { s[s.len() - 1 - i] } else { 1 };
            if size != 1 && size != max {
                return Err(DmShapeErr::ShapeMismatch {
                    shapes: shapes.iter().map(|s| s.to_vec()).collect(),
                }
                .into());
            }
        }
        unified[out_ndim - 1 - i] = max;
    }
    Ok(unified)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unify_basic() {
        assert_eq!(unify_shapes(&[&[3, 1], &[1, 4]]).unwrap(), vec![3, 4]);
        assert_eq!(unify_shapes(&[&[2, 3], &[3]]).unwrap(), vec![2, 3]);
        assert_eq!(unify_shapes(&[&[5]]).unwrap(), vec![5]);
        assert_eq!(unify_shapes(&[&[4, 4], &[]]).unwrap(), vec![4, 4]);
        assert!(unify_shapes(&[&[2, 3], &[2, 4]]).is_err());
    }

    #[test]
    fn test_unify_order_independent() {
        let shapes: Vec<&[usize]> = vec![&[3, 1], &[1, 4], &[3, 4], &[4]];
        let expect = unify_shapes(&shapes).unwrap();
        // the padding/max rule is commutative over operands
        let mut rev = shapes.clone();
        rev.reverse();
        assert_eq!(unify_shapes(&rev).unwrap(), expect);
        let rotated: Vec<&[usize]> = vec![&[4], &[3, 4], &[3, 1], &[1, 4]];
        assert_eq!(unify_shapes(&rotated).unwrap(), expect);
    }

    #[test]
    fn test_range_algebra() {
        let a = DimRange::new(2, 6);
        let b = DimRange::new(4, 8);
        assert_eq!(a.intersect(&b), DimRange::new(4, 6));
        assert!(a.intersect(&DimRange::new(6, 8)).is_empty());
        assert!(a.contains(&DimRange::new(3, 5)));
        assert!(!a.contains(&DimRange::new(1, 5)));

        let region = vec![DimRange::new(2, 4), DimRange::new(0, 3)];
        assert_eq!(region_shape(&region), vec![2, 3]);
        assert_eq!(region_len(&region), 6);
        let origin = vec![DimRange::new(2, 8), DimRange::new(0, 4)];
        let rel = region_to_relative(&region, &origin);
        assert_eq!(rel, vec![DimRange::new(0, 2), DimRange::new(0, 3)]);
        assert_eq!(region_from_relative(&rel, &origin), region);
    }

    #[test]
    fn test_strides() {
        assert_eq!(strides_of(&[3, 4]), vec![4, 1]);
        assert_eq!(strides_of(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(strides_of(&[]), Vec::<usize>::new());
    }
}
