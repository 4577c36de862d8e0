use downcast_rs::{impl_downcast, Downcast};
use serde::de::DeserializeOwned;

use super::{m_p2p::MsgId, msgs};
use crate::result::{DmResult, ErrCvt};

macro_rules! count_msgs {
    ($msg:ty) => {1u32};
    ($msg:ty,$($msgs:ty),+) => {1u32 + count_msgs!($($msgs),+)};
}

macro_rules! define_msg_ids {
    (($msg:ty,$arg:ident,$verify:block)) => {
        impl MsgPack for $msg {
            fn msg_id(&self) -> MsgId {
                0
            }
            fn verify(&self)->bool{
                let $arg=self;
                $verify
            }
            fn encode_to_vec(&self) -> Vec<u8> {
                bincode::serialize(self).unwrap_or_else(|err| {
                    panic!("encode msg failed: {:?}", err);
                })
            }
        }
    };
    (($msg:ty,$arg:ident,$verify:block),$(($msgs:ty,$args:ident,$verifies:block)),+) => {
        impl MsgPack for $msg {
            fn msg_id(&self) -> MsgId {
                count_msgs!($($msgs),+)
            }
            fn verify(&self)->bool{
                let $arg=self;
                $verify
            }
            fn encode_to_vec(&self) -> Vec<u8> {
                bincode::serialize(self).unwrap_or_else(|err| {
                    panic!("encode msg failed: {:?}", err);
                })
            }
        }
        define_msg_ids!($(($msgs,$args,$verifies)),+);
    };
}

pub trait MsgPack: std::fmt::Debug + Downcast + Send + Sync {
    fn msg_id(&self) -> MsgId;
    fn verify(&self) -> bool;
    fn encode_to_vec(&self) -> Vec<u8>;
}

impl_downcast!(MsgPack);

pub fn decode_msg<M: DeserializeOwned>(bytes: &[u8]) -> DmResult<M> {
    bincode::deserialize(bytes).map_err(|err| ErrCvt(err).to_dm_serial_err())
}

define_msg_ids!(
    (msgs::InstallPartReq, pack, { !pack.meta.parts.is_empty() }),
    (msgs::InstallPartResp, _pack, { true }),
    (msgs::FetchSliceReq, pack, {
        pack.range.iter().all(|r| r.begin <= r.end)
    }),
    (msgs::FetchSliceResp, _pack, { true }),
    (msgs::DropPartReq, _pack, { true }),
    (msgs::DropPartResp, _pack, { true }),
    (msgs::ExecuteUnitReq, pack, {
        pack.unit_range.len() == pack.dest_range.len()
    }),
    (msgs::ExecuteUnitResp, _pack, { true }),
    (msgs::MaterializeUnitReq, pack, {
        pack.meta.shape.len() == pack.plan.shape().len()
    }),
    (msgs::MaterializeUnitResp, _pack, { true })
);

pub trait RPCReq: MsgPack + DeserializeOwned + Default {
    type Resp: MsgPack + DeserializeOwned + Default;
}

impl RPCReq for msgs::InstallPartReq {
    type Resp = msgs::InstallPartResp;
}

impl RPCReq for msgs::FetchSliceReq {
    type Resp = msgs::FetchSliceResp;
}

impl RPCReq for msgs::DropPartReq {
    type Resp = msgs::DropPartResp;
}

impl RPCReq for msgs::ExecuteUnitReq {
    type Resp = msgs::ExecuteUnitResp;
}

impl RPCReq for msgs::MaterializeUnitReq {
    type Resp = msgs::MaterializeUnitResp;
}
