use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    general::data::{
        m_darray_manager::PartStore,
        shape::{region_shape, shape_len, strides_of, DimRange},
    },
    result::{DmComputeErr, DmResult},
};

/// the local evaluator's function vocabulary; plans cross node
/// boundaries so the function must be a tag, not a closure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ElemFunc {
    #[default]
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Pow,
    Neg,
    Abs,
}

impl ElemFunc {
    pub fn name(&self) -> &'static str {
        match self {
            ElemFunc::Add => "add",
            ElemFunc::Sub => "sub",
            ElemFunc::Mul => "mul",
            ElemFunc::Div => "div",
            ElemFunc::Min => "min",
            ElemFunc::Max => "max",
            ElemFunc::Pow => "pow",
            ElemFunc::Neg => "neg",
            ElemFunc::Abs => "abs",
        }
    }
    pub fn is_unary(&self) -> bool {
        matches!(self, ElemFunc::Neg | ElemFunc::Abs)
    }
    pub fn check_arity(&self, actual: usize) -> DmResult<()> {
        let ok = match self {
            ElemFunc::Neg | ElemFunc::Abs => actual == 1,
            ElemFunc::Sub | ElemFunc::Div | ElemFunc::Pow => actual == 2,
            // folded left over any operand count
            ElemFunc::Add | ElemFunc::Mul | ElemFunc::Min | ElemFunc::Max => actual >= 2,
        };
        if ok {
            Ok(())
        } else {
            Err(DmComputeErr::FuncArityNotMatch {
                func: self.name(),
                expect: if self.is_unary() { 1 } else { 2 },
                actual,
            }
            .into())
        }
    }
    fn apply1(&self, a: f64) -> f64 {
        match self {
            ElemFunc::Neg => -a,
            ElemFunc::Abs => a.abs(),
            _ => unreachable!("unary apply on {:?}", self),
        }
    }
    fn apply2(&self, a: f64, b: f64) -> DmResult<f64> {
        match self {
            ElemFunc::Add => Ok(a + b),
            ElemFunc::Sub => Ok(a - b),
            ElemFunc::Mul => Ok(a * b),
            ElemFunc::Div => {
                if b == 0.0 {
                    Err(DmComputeErr::DivideByZero.into())
                } else {
                    Ok(a / b)
                }
            }
            ElemFunc::Min => Ok(a.min(b)),
            ElemFunc::Max => Ok(a.max(b)),
            ElemFunc::Pow => Ok(a.powf(b)),
            ElemFunc::Neg | ElemFunc::Abs => unreachable!("binary apply on {:?}", self),
        }
    }
}

/// concrete locally held operand data after reduction
pub enum Block {
    /// fetched or assembled copy
    Owned { dims: Vec<usize>, data: Vec<f64> },
    /// window into this node's own partition storage, no copy
    Shared {
        store: Arc<PartStore>,
        window: Vec<DimRange>,
    },
}

impl Block {
    pub fn dims(&self) -> Vec<usize> {
        match self {
            Block::Owned { dims, .. } => dims.clone(),
            Block::Shared { window, .. } => region_shape(window),
        }
    }
    fn materialize_broadcast(&self, out_dims: &[usize]) -> Vec<f64> {
        match self {
            Block::Owned { dims, data } => {
                let window: Vec<DimRange> = dims.iter().map(|&len| DimRange::whole(len)).collect();
                gather_broadcast(data, dims, &window, out_dims)
            }
            Block::Shared { store, window } => {
                let storage_dims = region_shape(&store.range);
                let guard = store.data.read();
                gather_broadcast(&guard, &storage_dims, window, out_dims)
            }
        }
    }
}

/// fully local operation tree, every leaf directly readable
pub enum LocalNode {
    Op {
        func: ElemFunc,
        children: Vec<LocalNode>,
    },
    Blk(Block),
    Scalar(f64),
}

/// read a window of a flat row major buffer, broadcast to out_dims:
/// window dims align to the trailing dims of out_dims, a singleton
/// window dim repeats its single value over the whole out extent
fn gather_broadcast(
    storage: &[f64],
    storage_dims: &[usize],
    window: &[DimRange],
    out_dims: &[usize],
) -> Vec<f64> {
    let out_len = shape_len(out_dims);
    let mut out = Vec::with_capacity(out_len);
    if out_len == 0 {
        return out;
    }
    let strides = strides_of(storage_dims);
    let align = out_dims.len() - window.len();
    let mut idx = vec![0usize; out_dims.len()];
    loop {
        let mut off = 0;
        for (j, r) in window.iter().enumerate() {
            let src_i = if r.len() == 1 {
                r.begin
            } else {
                r.begin + idx[j + align]
            };
            off += src_i * strides[j];
        }
        out.push(storage[off]);
        let mut done = true;
        for d in (0..out_dims.len()).rev() {
            idx[d] += 1;
            if idx[d] < out_dims[d] {
                done = false;
                break;
            }
            idx[d] = 0;
        }
        if done {
            break;
        }
    }
    out
}

/// conventional elementwise evaluation of a fully local tree into a
/// flat buffer of out_dims extent
pub fn eval_local(node: &LocalNode, out_dims: &[usize]) -> DmResult<Vec<f64>> {
    match node {
        LocalNode::Scalar(v) => Ok(vec![*v; shape_len(out_dims)]),
        LocalNode::Blk(b) => Ok(b.materialize_broadcast(out_dims)),
        LocalNode::Op { func, children } => {
            func.check_arity(children.len())?;
            let mut bufs = Vec::with_capacity(children.len());
            for c in children {
                bufs.push(eval_local(c, out_dims)?);
            }
            if func.is_unary() {
                let mut buf = bufs.pop().unwrap();
                for v in buf.iter_mut() {
                    *v = func.apply1(*v);
                }
                return Ok(buf);
            }
            let mut iter = bufs.into_iter();
            let mut acc = iter.next().unwrap();
            for buf in iter {
                for (a, b) in acc.iter_mut().zip(buf.into_iter()) {
                    *a = func.apply2(*a, b)?;
                }
            }
            Ok(acc)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(dims: Vec<usize>, data: Vec<f64>) -> LocalNode {
        LocalNode::Blk(Block::Owned { dims, data })
    }

    #[test]
    fn test_broadcast_outer_sum() {
        // (3,1) + (1,4) -> (3,4), result[i][j] = a[i] + b[j]
        let a = owned(vec![3, 1], vec![1.0, 2.0, 3.0]);
        let b = owned(vec![1, 4], vec![10.0; 4]);
        let tree = LocalNode::Op {
            func: ElemFunc::Add,
            children: vec![a, b],
        };
        let out = eval_local(&tree, &[3, 4]).unwrap();
        for i in 0..3 {
            for j in 0..4 {
                assert_eq!(out[i * 4 + j], (i + 1) as f64 + 10.0);
            }
        }
    }

    #[test]
    fn test_missing_dim_and_scalar() {
        // (2,3) * (3) with a scalar added on top
        let a = owned(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = owned(vec![3], vec![2.0, 2.0, 2.0]);
        let tree = LocalNode::Op {
            func: ElemFunc::Add,
            children: vec![
                LocalNode::Op {
                    func: ElemFunc::Mul,
                    children: vec![a, b],
                },
                LocalNode::Scalar(1.0),
            ],
        };
        let out = eval_local(&tree, &[2, 3]).unwrap();
        assert_eq!(out, vec![3.0, 5.0, 7.0, 9.0, 11.0, 13.0]);
    }

    #[test]
    fn test_divide_by_zero_is_err() {
        let a = owned(vec![2], vec![1.0, 2.0]);
        let b = owned(vec![2], vec![2.0, 0.0]);
        let tree = LocalNode::Op {
            func: ElemFunc::Div,
            children: vec![a, b],
        };
        assert!(eval_local(&tree, &[2]).is_err());
    }

    #[test]
    fn test_unary_and_arity() {
        let tree = LocalNode::Op {
            func: ElemFunc::Neg,
            children: vec![owned(vec![2], vec![1.0, -2.0])],
        };
        assert_eq!(eval_local(&tree, &[2]).unwrap(), vec![-1.0, 2.0]);
        let bad = LocalNode::Op {
            func: ElemFunc::Sub,
            children: vec![LocalNode::Scalar(1.0)],
        };
        assert!(eval_local(&bad, &[2]).is_err());
    }
}
