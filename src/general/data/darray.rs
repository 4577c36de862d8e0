use serde::{Deserialize, Serialize};

use super::shape::{region_is_empty, region_shape, strides_of, DimRange};
use crate::{
    result::{DmDataErr, DmResult, DmShapeErr},
    sys::NodeID,
};

pub type ArrayId = u64;

/// one worker's owned slice of a distributed array
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodePart {
    pub node_id: NodeID,
    pub range: Vec<DimRange>,
}

/// identity of a distributed array. small, travels inside plans and
/// requests; bulk data stays on the owning workers
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DArrayMeta {
    pub unique_id: ArrayId,
    pub shape: Vec<usize>,
    pub parts: Vec<NodePart>,
}

impl DArrayMeta {
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }
    pub fn owners_of(&self) -> Vec<NodeID> {
        self.parts.iter().map(|p| p.node_id).collect()
    }
    pub fn part_of(&self, node: NodeID) -> Option<&NodePart> {
        self.parts.iter().find(|p| p.node_id == node)
    }
    pub fn owned_range(&self, node: NodeID) -> Option<&Vec<DimRange>> {
        self.part_of(node).map(|p| &p.range)
    }
}

/// plain in-memory array with no partitioning, row major
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LocalArray {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl LocalArray {
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> DmResult<Self> {
        let expect: usize = shape.iter().product();
        if data.len() != expect {
            return Err(DmDataErr::LocalArrayLenNotMatch {
                shape,
                data_len: data.len(),
            }
            .into());
        }
        Ok(Self { shape, data })
    }
    /// zero dimensional, behaves like a scalar operand
    pub fn zero_dim(v: f64) -> Self {
        Self {
            shape: vec![],
            data: vec![v],
        }
    }
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }
}

/// rectangular sub view of a distributed array, destination only,
/// carries no storage of its own
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DArrayView {
    pub meta: DArrayMeta,
    pub range: Vec<DimRange>,
}

impl DArrayView {
    pub fn new(meta: DArrayMeta, range: Vec<DimRange>) -> DmResult<Self> {
        if range.len() != meta.shape.len() {
            return Err(DmShapeErr::ViewDimCountNotMatch {
                shape_ndim: meta.shape.len(),
                range_ndim: range.len(),
            }
            .into());
        }
        for (r, &len) in range.iter().zip(meta.shape.iter()) {
            if r.begin > r.end || r.end > len {
                return Err(DmShapeErr::ViewOutOfBounds {
                    shape: meta.shape.clone(),
                    range: range.clone(),
                }
                .into());
            }
        }
        Ok(Self { meta, range })
    }
    pub fn whole(meta: DArrayMeta) -> Self {
        let range = meta.shape.iter().map(|&len| DimRange::whole(len)).collect();
        Self { meta, range }
    }
    pub fn shape(&self) -> Vec<usize> {
        region_shape(&self.range)
    }
}

/// copy a rectangular region between two flat row major buffers,
/// region extents must match
pub fn copy_region(
    src: &[f64],
    src_shape: &[usize],
    src_region: &[DimRange],
    dst: &mut [f64],
    dst_shape: &[usize],
    dst_region: &[DimRange],
) {
    let ndim = src_region.len();
    assert_eq!(ndim, dst_region.len());
    assert_eq!(region_shape(src_region), region_shape(dst_region));
    if ndim == 0 {
        dst[0] = src[0];
        return;
    }
    if region_is_empty(src_region) {
        return;
    }
    let src_strides = strides_of(src_shape);
    let dst_strides = strides_of(dst_shape);
    let row_len = src_region[ndim - 1].len();
    let lead = ndim - 1;
    let extents: Vec<usize> = src_region[..lead].iter().map(|r| r.len()).collect();
    let mut idx = vec![0usize; lead];
    'rows: loop {
        let mut s_off = src_region[ndim - 1].begin;
        let mut d_off = dst_region[ndim - 1].begin;
        for d in 0..lead {
            s_off += (src_region[d].begin + idx[d]) * src_strides[d];
            d_off += (dst_region[d].begin + idx[d]) * dst_strides[d];
        }
        dst[d_off..d_off + row_len].copy_from_slice(&src[s_off..s_off + row_len]);
        for d in (0..lead).rev() {
            idx[d] += 1;
            if idx[d] < extents[d] {
                continue 'rows;
            }
            idx[d] = 0;
        }
        break;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::general::data::shape::region_of_shape;

    #[test]
    fn test_copy_region() {
        // 3x4 source, copy middle 2x2 block into 2x2 dst
        let src: Vec<f64> = (0..12).map(|v| v as f64).collect();
        let mut dst = vec![0.0; 4];
        copy_region(
            &src,
            &[3, 4],
            &[DimRange::new(1, 3), DimRange::new(1, 3)],
            &mut dst,
            &[2, 2],
            &region_of_shape(&[2, 2]),
        );
        assert_eq!(dst, vec![5.0, 6.0, 9.0, 10.0]);

        // write it back somewhere else
        let mut back = vec![0.0; 12];
        copy_region(
            &dst,
            &[2, 2],
            &region_of_shape(&[2, 2]),
            &mut back,
            &[3, 4],
            &[DimRange::new(0, 2), DimRange::new(2, 4)],
        );
        assert_eq!(back[2], 5.0);
        assert_eq!(back[3], 6.0);
        assert_eq!(back[6], 9.0);
        assert_eq!(back[7], 10.0);
    }

    #[test]
    fn test_view_bounds() {
        let meta = DArrayMeta {
            unique_id: 1,
            shape: vec![4, 4],
            parts: vec![],
        };
        assert!(DArrayView::new(meta.clone(), vec![DimRange::new(0, 2)]).is_err());
        assert!(
            DArrayView::new(meta.clone(), vec![DimRange::new(0, 2), DimRange::new(2, 5)]).is_err()
        );
        let v =
            DArrayView::new(meta.clone(), vec![DimRange::new(1, 3), DimRange::new(0, 4)]).unwrap();
        assert_eq!(v.shape(), vec![2, 4]);
        assert_eq!(DArrayView::whole(meta).shape(), vec![4, 4]);
    }

    #[test]
    fn test_local_array_len_check() {
        assert!(LocalArray::new(vec![2, 3], vec![0.0; 6]).is_ok());
        assert!(LocalArray::new(vec![2, 3], vec![0.0; 5]).is_err());
        assert_eq!(LocalArray::zero_dim(7.0).ndim(), 0);
    }
}
