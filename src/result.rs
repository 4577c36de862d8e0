use std::{fmt::Debug, sync::Arc};

use camelpaste::paste;
use thiserror::Error;

use crate::{general::data::shape::DimRange, sys::NodeID};

pub type DmResult<T> = Result<T, DmError>;

#[derive(Debug)]
pub enum DmShapeErr {
    /// operand shapes don't unify under the trailing max-or-1 rule
    ShapeMismatch {
        shapes: Vec<Vec<usize>>,
    },
    /// explicit destination must equal the unified shape exactly
    DestShapeNotEqual {
        unified: Vec<usize>,
        dest: Vec<usize>,
    },
    /// requested range must nest inside the operand's declared range
    RangeNotNested {
        dim: usize,
        declared: DimRange,
        requested: DimRange,
    },
    ViewOutOfBounds {
        shape: Vec<usize>,
        range: Vec<DimRange>,
    },
    ViewDimCountNotMatch {
        shape_ndim: usize,
        range_ndim: usize,
    },
}

#[derive(Debug)]
pub enum DmNetworkLogicErr {
    MsgIdNotDispatchable(u32),
    MsgVerifyFailed(u32),
    InvaidNodeID(NodeID),
}

#[derive(Debug)]
pub enum DmNetworkConnErr {
    NodeUnreachable(NodeID),
    ChannelClosed(NodeID),
    RPCTimout(NodeID),
}

#[derive(Debug)]
pub enum DmSerialErr {
    BincodeErr(Box<bincode::ErrorKind>),
}

#[derive(Debug)]
pub enum DmDataErr {
    ArrayNotFound {
        unique_id: u64,
        context: String,
    },
    PartNotOnThisNode {
        unique_id: u64,
        node: NodeID,
    },
    FetchRangeNotOwned {
        unique_id: u64,
        node: NodeID,
        range: Vec<DimRange>,
    },
    WriteRangeNotOwned {
        unique_id: u64,
        node: NodeID,
        range: Vec<DimRange>,
    },
    PartDataLenNotMatch {
        unique_id: u64,
        expect: usize,
        actual: usize,
    },
    NoWorkerNode,
    RemoteDataOp {
        node: NodeID,
        reason: String,
    },
    LocalArrayLenNotMatch {
        shape: Vec<usize>,
        data_len: usize,
    },
}

#[derive(Debug)]
pub enum DmComputeErr {
    /// worker side failure, observed by the driver after the barrier
    RemoteExecution {
        node: NodeID,
        reason: String,
    },
    FuncArityNotMatch {
        func: &'static str,
        expect: usize,
        actual: usize,
    },
    DivideByZero,
}

#[derive(Error, Debug)]
pub enum DmError {
    #[error("ArcWrapper: {0:?}")]
    ArcWrapper(Arc<DmError>),

    #[error("Shape error: {0:?}")]
    DmShapeErr(DmShapeErr),

    #[error("Network logic error: {0:?}")]
    DmNetworkLogicErr(DmNetworkLogicErr),

    #[error("Network connection error: {0:?}")]
    DmNetworkConnErr(DmNetworkConnErr),

    #[error("Serial error: {0:?}")]
    DmSerialErr(DmSerialErr),

    #[error("Data error: {0:?}")]
    DmDataErr(DmDataErr),

    #[error("Compute error: {0:?}")]
    DmComputeErr(DmComputeErr),
}

impl From<DmShapeErr> for DmError {
    fn from(e: DmShapeErr) -> Self {
        DmError::DmShapeErr(e)
    }
}

impl From<DmNetworkLogicErr> for DmError {
    fn from(e: DmNetworkLogicErr) -> Self {
        DmError::DmNetworkLogicErr(e)
    }
}

impl From<DmNetworkConnErr> for DmError {
    fn from(e: DmNetworkConnErr) -> Self {
        DmError::DmNetworkConnErr(e)
    }
}

impl From<DmSerialErr> for DmError {
    fn from(e: DmSerialErr) -> Self {
        DmError::DmSerialErr(e)
    }
}

impl From<DmDataErr> for DmError {
    fn from(e: DmDataErr) -> Self {
        DmError::DmDataErr(e)
    }
}

impl From<DmComputeErr> for DmError {
    fn from(e: DmComputeErr) -> Self {
        DmError::DmComputeErr(e)
    }
}

pub struct ErrCvt<T>(pub T);

macro_rules! impl_err_convertor {
    ($t:ty,$sub_t:ty,$sub_tt:ty) => {
        paste! {
            impl ErrCvt<$t> {
                pub fn [<to_ $sub_t:snake>](self) -> DmError {
                    DmError::$sub_t($sub_t::$sub_tt(self.0))
                }
            }
        }
    };
}

impl_err_convertor!(Box<bincode::ErrorKind>, DmSerialErr, BincodeErr);

pub trait DmResultExt {
    fn todo_handle(&self);
}

impl<T: Debug> DmResultExt for DmResult<T> {
    #[inline]
    fn todo_handle(&self) {
        match self {
            Ok(_ok) => {}
            Err(err) => {
                tracing::warn!("result err: {:?}", err);
            }
        }
    }
}
