use super::{
    eval::{Block, LocalNode},
    plan::{Operand, PlanNode},
};
use crate::{
    general::data::{
        darray::copy_region,
        m_darray_manager::DArrayManager,
        shape::{region_nested_in, region_of_shape, region_shape, region_to_relative, DimRange},
    },
    result::{DmResult, DmShapeErr},
};

/// per dimension reconciliation of an operand's declared extents
/// against the requested region, trailing aligned:
/// - declared extent 1: always the single stored index
/// - requested nested inside declared: the requested range
/// - anything else: internal consistency failure, top level
///   unification should have ruled it out already
pub fn reconcile_region(op_shape: &[usize], req: &[DimRange]) -> DmResult<Vec<DimRange>> {
    if op_shape.len() > req.len() {
        return Err(DmShapeErr::ShapeMismatch {
            shapes: vec![op_shape.to_vec(), region_shape(req)],
        }
        .into());
    }
    let align = req.len() - op_shape.len();
    op_shape
        .iter()
        .enumerate()
        .map(|(j, &size)| {
            if size == 1 {
                return Ok(DimRange::new(0, 1));
            }
            let declared = DimRange::whole(size);
            let requested = req[j + align];
            if declared.contains(&requested) {
                Ok(requested)
            } else {
                Err(DmShapeErr::RangeNotNested {
                    dim: j,
                    declared,
                    requested,
                }
                .into())
            }
        })
        .collect()
}

/// reduce a plan against a requested region (in the destination's
/// coordinate system) to a tree every leaf of which is locally
/// readable: own partition data is referenced in place, foreign
/// partition data is explicitly fetched
pub async fn reduce_plan(
    manager: &DArrayManager,
    plan: &PlanNode,
    req: &[DimRange],
) -> DmResult<LocalNode> {
    match plan {
        PlanNode::Op { func, children, .. } => {
            let mut reduced = Vec::with_capacity(children.len());
            for c in children {
                reduced.push(Box::pin(reduce_plan(manager, c, req)).await?);
            }
            Ok(LocalNode::Op {
                func: *func,
                children: reduced,
            })
        }
        PlanNode::Leaf(Operand::Scalar(v)) => Ok(LocalNode::Scalar(*v)),
        PlanNode::Leaf(Operand::Local(arr)) => {
            if arr.ndim() == 0 {
                return Ok(LocalNode::Scalar(arr.data[0]));
            }
            // plan building distributes array shaped local leaves, so
            // this is only reached when reducing a raw tree; the data
            // is already here, just window it
            let resolved = reconcile_region(&arr.shape, req)?;
            let dims = region_shape(&resolved);
            let mut data = vec![0.0; dims.iter().product()];
            copy_region(
                &arr.data,
                &arr.shape,
                &resolved,
                &mut data,
                &dims,
                &region_of_shape(&dims),
            );
            Ok(LocalNode::Blk(Block::Owned { dims, data }))
        }
        PlanNode::Leaf(Operand::Dist(meta)) => {
            let resolved = reconcile_region(&meta.shape, req)?;
            if let Some(store) = manager.local_part(meta.unique_id) {
                if region_nested_in(&resolved, &store.range) {
                    let window = region_to_relative(&resolved, &store.range);
                    return Ok(LocalNode::Blk(Block::Shared { store, window }));
                }
            }
            let data = manager.fetch_region_assembled(meta, &resolved).await?;
            Ok(LocalNode::Blk(Block::Owned {
                dims: region_shape(&resolved),
                data,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_singleton() {
        // (3,1) against requested rows 1..3, cols 2..4
        let req = vec![DimRange::new(1, 3), DimRange::new(2, 4)];
        let resolved = reconcile_region(&[3, 1], &req).unwrap();
        assert_eq!(resolved, vec![DimRange::new(1, 3), DimRange::new(0, 1)]);
    }

    #[test]
    fn test_reconcile_missing_leading_dim() {
        // (4) against a 2d request aligns to the trailing dim
        let req = vec![DimRange::new(0, 3), DimRange::new(1, 4)];
        let resolved = reconcile_region(&[4], &req).unwrap();
        assert_eq!(resolved, vec![DimRange::new(1, 4)]);
    }

    #[test]
    fn test_reconcile_not_nested() {
        let req = vec![DimRange::new(2, 6)];
        assert!(reconcile_region(&[4], &req).is_err());
    }

    #[test]
    fn test_reconcile_zero_dim() {
        let req = vec![DimRange::new(0, 2)];
        assert_eq!(reconcile_region(&[], &req).unwrap(), vec![]);
    }
}
