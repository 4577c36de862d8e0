use serde::{Deserialize, Serialize};

use crate::general::{
    compute::plan::PlanNode,
    data::{
        darray::{ArrayId, DArrayMeta},
        shape::DimRange,
    },
};

/// install one partition's data on its owning worker, carries the
/// full meta so the worker learns the array's layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallPartReq {
    pub meta: DArrayMeta,
    pub data: Vec<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallPartResp {
    pub ok: bool,
    pub msg: String,
}

/// explicit cross node read of a sub range of one partition,
/// range in the array's global coords
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchSliceReq {
    pub unique_id: ArrayId,
    pub range: Vec<DimRange>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchSliceResp {
    pub ok: bool,
    pub msg: String,
    pub data: Vec<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DropPartReq {
    pub unique_id: ArrayId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DropPartResp {
    pub ok: bool,
}

/// one dispatcher unit against an existing destination array,
/// unit_range is relative to the destination view's origin
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteUnitReq {
    pub plan: PlanNode,
    pub dest_meta: DArrayMeta,
    pub dest_range: Vec<DimRange>,
    pub unit_range: Vec<DimRange>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteUnitResp {
    pub ok: bool,
    pub msg: String,
}

/// one materializer unit: produce this worker's partition of a fresh
/// array directly from the plan, no separate write back
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaterializeUnitReq {
    pub meta: DArrayMeta,
    pub plan: PlanNode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaterializeUnitResp {
    pub ok: bool,
    pub msg: String,
}
