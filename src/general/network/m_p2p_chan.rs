use std::net::SocketAddr;

use async_trait::async_trait;
use dashmap::DashMap;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::m_p2p::{MsgId, P2PKernel, TaskId};
use crate::{
    config::NodesConfig,
    logical_module_view_impl,
    result::{DmNetworkConnErr, DmNetworkLogicErr, DmResult, DmResultExt},
    sys::{LogicalModule, LogicalModuleNewArgs, NodeID},
    util::JoinHandleWrapper,
};

/// one serialized message frame; even node local sends go through
/// encode, a foreign read is always an explicit copy
struct ChanFrame {
    from: NodeID,
    task_id: TaskId,
    msg_id: MsgId,
    data: Vec<u8>,
}

lazy_static! {
    // process wide router table, nodes keyed by their listen addr
    static ref CHAN_ROUTER: DashMap<SocketAddr, mpsc::UnboundedSender<ChanFrame>> = DashMap::new();
}

/// in process channel kernel; a wire transport implementing P2PKernel
/// can stand in for it without touching the rpc layer above
pub struct P2PChanNode {
    nodes_config: NodesConfig,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ChanFrame>>>,
    view: P2PChanView,
}

logical_module_view_impl!(P2PChanView);
logical_module_view_impl!(P2PChanView, p2p, crate::general::network::m_p2p::P2PModule);

#[async_trait]
impl LogicalModule for P2PChanNode {
    fn inner_new(args: LogicalModuleNewArgs) -> Self
    where
        Self: Sized,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr = args.nodes_config.this.1.addr;
        if CHAN_ROUTER.insert(addr, tx).is_some() {
            tracing::warn!("chan router entry for {} replaced", addr);
        }
        Self {
            nodes_config: args.nodes_config.clone(),
            rx: Mutex::new(Some(rx)),
            view: P2PChanView::new(args.logical_modules_ref.clone()),
        }
    }

    async fn start(&self) -> DmResult<Vec<JoinHandleWrapper>> {
        let mut rx = self.rx.lock().take().unwrap_or_else(|| {
            panic!("chan kernel started twice");
        });
        let view = self.view.clone();
        let handle = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                view.p2p()
                    .dispatch(
                        frame.from,
                        frame.msg_id,
                        frame.task_id,
                        frame.data.into(),
                    )
                    .todo_handle();
            }
        });
        Ok(vec![handle.into()])
    }
}

#[async_trait]
impl P2PKernel for P2PChanNode {
    async fn send(
        &self,
        node: NodeID,
        task_id: TaskId,
        msg_id: MsgId,
        req_data: Vec<u8>,
    ) -> DmResult<()> {
        if !self.nodes_config.node_exist(node) {
            return Err(DmNetworkLogicErr::InvaidNodeID(node).into());
        }
        let addr = self.nodes_config.get_nodeconfig(node).addr;
        let Some(tx) = CHAN_ROUTER.get(&addr) else {
            return Err(DmNetworkConnErr::NodeUnreachable(node).into());
        };
        tx.send(ChanFrame {
            from: self.nodes_config.this_node(),
            task_id,
            msg_id,
            data: req_data,
        })
        .map_err(|_| DmNetworkConnErr::ChannelClosed(node).into())
    }
}
