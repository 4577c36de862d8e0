use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};

use super::eval::ElemFunc;
use crate::{
    general::data::{
        darray::{DArrayMeta, LocalArray},
        shape::unify_shapes,
    },
    result::DmResult,
};

/// leaf operand kinds; dispatch is keyed on this tag, never on an
/// open ended trait
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumAsInner)]
pub enum Operand {
    Dist(DArrayMeta),
    Local(LocalArray),
    Scalar(f64),
}

impl Operand {
    pub fn shape(&self) -> &[usize] {
        match self {
            Operand::Dist(meta) => &meta.shape,
            Operand::Local(arr) => &arr.shape,
            Operand::Scalar(_) => &[],
        }
    }
}

impl Default for Operand {
    fn default() -> Self {
        Operand::Scalar(0.0)
    }
}

/// operation tree: function + ordered children + target axes,
/// serializable so a whole plan can be shipped to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlanNode {
    Leaf(Operand),
    Op {
        func: ElemFunc,
        shape: Vec<usize>,
        children: Vec<PlanNode>,
    },
}

impl Default for PlanNode {
    fn default() -> Self {
        PlanNode::Leaf(Operand::default())
    }
}

impl PlanNode {
    pub fn dist(meta: DArrayMeta) -> Self {
        PlanNode::Leaf(Operand::Dist(meta))
    }
    pub fn local(arr: LocalArray) -> Self {
        PlanNode::Leaf(Operand::Local(arr))
    }
    pub fn scalar(v: f64) -> Self {
        PlanNode::Leaf(Operand::Scalar(v))
    }
    /// build an inner node: unify child target axes, check arity;
    /// fails before anything is dispatched
    pub fn op(func: ElemFunc, children: Vec<PlanNode>) -> DmResult<Self> {
        func.check_arity(children.len())?;
        let shapes: Vec<&[usize]> = children.iter().map(|c| c.shape()).collect();
        let shape = unify_shapes(&shapes)?;
        Ok(PlanNode::Op {
            func,
            shape,
            children,
        })
    }
    pub fn shape(&self) -> &[usize] {
        match self {
            PlanNode::Leaf(operand) => operand.shape(),
            PlanNode::Op { shape, .. } => shape,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::general::data::shape::DimRange;

    #[test]
    fn test_op_unifies_children() {
        let a = PlanNode::local(LocalArray::new(vec![3, 1], vec![0.0; 3]).unwrap());
        let b = PlanNode::local(LocalArray::new(vec![1, 4], vec![0.0; 4]).unwrap());
        let node = PlanNode::op(ElemFunc::Add, vec![a, b]).unwrap();
        assert_eq!(node.shape(), &[3, 4]);
    }

    #[test]
    fn test_op_rejects_mismatch() {
        let a = PlanNode::local(LocalArray::new(vec![2, 3], vec![0.0; 6]).unwrap());
        let b = PlanNode::local(LocalArray::new(vec![2, 4], vec![0.0; 8]).unwrap());
        assert!(PlanNode::op(ElemFunc::Add, vec![a, b]).is_err());
    }

    #[test]
    fn test_nested_tree_shape() {
        let meta = DArrayMeta {
            unique_id: 7,
            shape: vec![4],
            parts: vec![crate::general::data::darray::NodePart {
                node_id: 2,
                range: vec![DimRange::whole(4)],
            }],
        };
        let inner = PlanNode::op(
            ElemFunc::Mul,
            vec![PlanNode::dist(meta), PlanNode::scalar(2.0)],
        )
        .unwrap();
        let outer = PlanNode::op(
            ElemFunc::Add,
            vec![
                inner,
                PlanNode::local(LocalArray::new(vec![3, 1], vec![0.0; 3]).unwrap()),
            ],
        )
        .unwrap();
        assert_eq!(outer.shape(), &[3, 4]);
    }
}
