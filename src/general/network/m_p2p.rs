use std::{
    collections::HashMap,
    marker::PhantomData,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use super::{
    m_p2p_chan::P2PChanNode,
    msg_pack::{decode_msg, MsgPack, RPCReq},
};
use crate::{
    config::NodesConfig,
    logical_module_view_impl,
    result::{DmNetworkConnErr, DmNetworkLogicErr, DmResult},
    sys::{LogicalModule, LogicalModuleNewArgs, NodeID},
    util::JoinHandleWrapper,
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;

pub type TaskId = u32;
pub type MsgId = u32;

#[async_trait]
pub trait P2PKernel: LogicalModule {
    async fn send(
        &self,
        node: NodeID,
        task_id: TaskId,
        msg_id: MsgId,
        req_data: Vec<u8>,
    ) -> DmResult<()>;
}

#[derive(Default)]
pub struct RPCCaller<R: RPCReq> {
    _phantom: std::marker::PhantomData<R>,
}

#[derive(Default)]
pub struct RPCHandler<R: RPCReq> {
    _phantom: std::marker::PhantomData<R>,
}

impl<R: RPCReq> RPCCaller<R> {
    pub fn new() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }
    pub fn regist(&self, p2p: &P2PModule) {
        p2p.regist_rpc_send::<R>();
    }
    pub async fn call(
        &self,
        p2p: &P2PModule,
        node_id: NodeID,
        req: R,
        dur: Option<Duration>,
    ) -> DmResult<R::Resp> {
        #[cfg(feature = "rpc-log")]
        tracing::debug!(
            "call rpc {:?} from {} to {}",
            req,
            p2p.nodes_config.this_node(),
            node_id
        );
        p2p.call_rpc::<R>(node_id, req, dur).await
    }
}

impl<R: RPCReq> RPCHandler<R> {
    pub fn new() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }
    pub fn regist<F>(&self, p2p: &P2PModule, req_handler: F)
    where
        F: Fn(RPCResponsor<R>, R) -> DmResult<()> + Send + Sync + 'static,
    {
        p2p.regist_rpc_recv::<R, F>(req_handler);
    }
}

pub struct P2PModule {
    dispatch_map: RwLock<
        HashMap<
            u32,
            Box<
                dyn Fn(NodeID, &Self, TaskId, DispatchPayload) -> DmResult<()>
                    + 'static
                    + Send
                    + Sync,
            >,
        >,
    >,
    waiting_tasks: crossbeam_skiplist::SkipMap<
        (TaskId, NodeID),
        Mutex<Option<tokio::sync::oneshot::Sender<Box<dyn MsgPack>>>>,
    >,
    pub p2p_kernel: P2PChanNode,
    pub nodes_config: NodesConfig,
    pub next_task_id: AtomicU32,
    view: P2PView,
}

logical_module_view_impl!(P2PView);
logical_module_view_impl!(P2PView, p2p, P2PModule);

#[async_trait]
impl LogicalModule for P2PModule {
    fn inner_new(args: LogicalModuleNewArgs) -> Self
    where
        Self: Sized,
    {
        let nodes_config = args.nodes_config.clone();
        Self {
            p2p_kernel: P2PChanNode::new(args.clone()),
            dispatch_map: HashMap::new().into(),
            waiting_tasks: Default::default(),
            nodes_config,
            next_task_id: AtomicU32::new(0),
            view: P2PView::new(args.logical_modules_ref.clone()),
        }
    }

    async fn start(&self) -> DmResult<Vec<JoinHandleWrapper>> {
        let sub = self.p2p_kernel.start().await?;
        Ok(sub)
    }
}

pub struct RPCResponsor<R: RPCReq> {
    _p: PhantomData<R>,
    responsor: Responser,
}
impl<R: RPCReq> RPCResponsor<R> {
    pub async fn send_resp(&self, resp: R::Resp) -> DmResult<()> {
        self.responsor.send_resp(resp).await
    }
    pub fn node_id(&self) -> NodeID {
        self.responsor.node_id
    }
    pub fn task_id(&self) -> TaskId {
        self.responsor.task_id
    }
}

pub struct Responser {
    task_id: TaskId,
    pub node_id: NodeID,
    view: P2PView,
}

impl Responser {
    pub async fn send_resp<RESP>(&self, resp: RESP) -> DmResult<()>
    where
        RESP: MsgPack + Default,
    {
        #[cfg(feature = "rpc-log")]
        tracing::debug!(
            "resp rpc {:?} from {} to {}",
            resp,
            self.view.p2p().nodes_config.this_node(),
            self.node_id
        );
        if self.view.p2p().nodes_config.this.0 == self.node_id {
            self.view.p2p().dispatch(
                self.node_id,
                resp.msg_id(),
                self.task_id,
                DispatchPayload::Local(Box::new(resp)),
            )
        } else {
            self.view
                .p2p()
                .send_resp(self.node_id, self.task_id, resp)
                .await
        }
    }
}

pub enum DispatchPayload {
    Remote(Vec<u8>),
    /// zero copy for node local request/response pairs
    Local(Box<dyn MsgPack>),
}

impl From<Vec<u8>> for DispatchPayload {
    fn from(b: Vec<u8>) -> Self {
        DispatchPayload::Remote(b)
    }
}

impl P2PModule {
    // on msg arrival, the registered callback is called
    fn regist_dispatch<M, F>(&self, m: M, f: F)
    where
        M: MsgPack + DeserializeOwned + Default,
        F: Fn(Responser, M) -> DmResult<()> + Send + Sync + 'static,
    {
        let mut map = self.dispatch_map.write();
        let old = map.insert(
            m.msg_id(),
            Box::new(move |nid, p2p, task_id, data| {
                let msg = match data {
                    DispatchPayload::Remote(b) => {
                        assert!(nid != p2p.view.p2p().nodes_config.this.0);
                        decode_msg::<M>(&b)?
                    }
                    DispatchPayload::Local(b) => {
                        assert!(nid == p2p.view.p2p().nodes_config.this.0);
                        *b.downcast::<M>().unwrap()
                    }
                };
                if !msg.verify() {
                    return Err(DmNetworkLogicErr::MsgVerifyFailed(msg.msg_id()).into());
                }
                #[cfg(feature = "rpc-log")]
                tracing::debug!(
                    "handling rpc {:?} from {} to {}",
                    msg,
                    nid,
                    p2p.nodes_config.this_node(),
                );
                f(
                    Responser {
                        task_id,
                        node_id: nid,
                        view: p2p.view.clone(),
                    },
                    msg,
                )
            }),
        );
        assert!(old.is_none());
    }

    fn regist_rpc_send<REQ>(&self)
    where
        REQ: RPCReq,
    {
        // response arrives, wake the matching waiting task
        self.regist_dispatch(REQ::Resp::default(), |resp, v| {
            let cb = resp
                .view
                .p2p()
                .waiting_tasks
                .remove(&(resp.task_id, resp.node_id));
            if let Some(pack) = cb {
                pack.value()
                    .lock()
                    .take()
                    .unwrap()
                    .send(Box::new(v))
                    .unwrap_or_else(|err| {
                        panic!("send back to waiting task failed: {:?}", err);
                    });
            } else {
                tracing::warn!("taskid: {} not found", resp.task_id);
            }
            Ok(())
        })
    }

    fn regist_rpc_recv<REQ, F>(&self, req_handler: F)
    where
        REQ: RPCReq,
        F: Fn(RPCResponsor<REQ>, REQ) -> DmResult<()> + Send + Sync + 'static,
    {
        self.regist_dispatch(REQ::default(), move |resp, req| {
            req_handler(
                RPCResponsor {
                    _p: PhantomData,
                    responsor: resp,
                },
                req,
            )
        });
    }

    async fn send_resp<RESP>(&self, node_id: NodeID, task_id: TaskId, resp: RESP) -> DmResult<()>
    where
        RESP: MsgPack + Default,
    {
        self.p2p_kernel
            .send(node_id, task_id, resp.msg_id(), resp.encode_to_vec())
            .await
    }

    #[inline]
    async fn call_rpc<R>(&self, node_id: NodeID, req: R, dur: Option<Duration>) -> DmResult<R::Resp>
    where
        R: RPCReq,
    {
        let dur = dur.unwrap_or(Duration::from_millis(10000));
        self.call_rpc_inner::<R, R::Resp>(node_id, req, dur).await
    }

    async fn call_rpc_inner<REQ, RESP>(
        &self,
        node_id: NodeID,
        r: REQ,
        dur: Duration,
    ) -> DmResult<RESP>
    where
        REQ: MsgPack,
        RESP: MsgPack,
    {
        let taskid: TaskId = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = tokio::sync::oneshot::channel::<Box<dyn MsgPack>>();

        if node_id == self.nodes_config.this.0 {
            let _ = self
                .waiting_tasks
                .insert((taskid, node_id), Some(tx).into());
            if let Err(e) = self.dispatch(
                node_id,
                r.msg_id(),
                taskid,
                DispatchPayload::Local(Box::new(r)),
            ) {
                tracing::error!("Failed to dispatch rpc: {}", e);
            }
            let resp = rx.await.unwrap();
            let resp = resp.downcast::<RESP>().unwrap();

            return Ok(*resp);
        }

        let _ = self
            .waiting_tasks
            .insert((taskid, node_id), Some(tx).into());

        if let Err(err) = self
            .p2p_kernel
            .send(node_id, taskid, r.msg_id(), r.encode_to_vec())
            .await
        {
            let _ = self.waiting_tasks.remove(&(taskid, node_id)).unwrap();
            tracing::error!(
                "rpc send failed: {:?}, request({:?}) from node({:?})",
                err,
                r,
                self.nodes_config.this_node()
            );
            return Err(err);
        }

        let resp = match tokio::time::timeout(dur, rx).await {
            Ok(resp) => resp.unwrap_or_else(|err| {
                panic!("waiting for response failed: {:?}", err);
            }),
            Err(err) => {
                // maybe removed or not
                let _ = self.waiting_tasks.remove(&(taskid, node_id));
                tracing::error!(
                    "rpc timeout: {:?} to node {} with req {:?}",
                    err,
                    node_id,
                    r
                );
                return Err(DmNetworkConnErr::RPCTimout(node_id).into());
            }
        };

        let resp = resp.downcast::<RESP>().unwrap();

        Ok(*resp)
    }

    pub fn dispatch(
        &self,
        nid: NodeID,
        id: MsgId,
        taskid: TaskId,
        data: DispatchPayload,
    ) -> DmResult<()> {
        let read = self.dispatch_map.read();
        if let Some(cb) = read.get(&id) {
            cb(nid, self, taskid, data)?;
            Ok(())
        } else {
            tracing::warn!(
                "not match id: {}, this node: {}",
                id,
                self.nodes_config.this_node()
            );
            Err(DmNetworkLogicErr::MsgIdNotDispatchable(id).into())
        }
    }
}
