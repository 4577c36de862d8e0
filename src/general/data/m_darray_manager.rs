use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::{
    darray::{copy_region, ArrayId, DArrayMeta, LocalArray, NodePart},
    shape::{
        region_intersect, region_is_empty, region_len, region_nested_in, region_of_shape,
        region_shape, region_to_relative, DimRange,
    },
};
use crate::{
    general::network::{
        m_p2p::{P2PModule, RPCCaller, RPCHandler, RPCResponsor},
        msgs,
    },
    logical_module_view_impl,
    result::{DmDataErr, DmResult},
    sys::{LogicalModule, LogicalModuleNewArgs, NodeID},
    util::JoinHandleWrapper,
};

logical_module_view_impl!(DArrayManagerView);
logical_module_view_impl!(DArrayManagerView, p2p, P2PModule);
logical_module_view_impl!(DArrayManagerView, darray_manager, DArrayManager);

/// backing storage of one owned partition, row major over the owned
/// range's extents
pub struct PartStore {
    pub range: Vec<DimRange>,
    pub data: RwLock<Vec<f64>>,
}

/// partition registry + the partitioning strategy. every node runs
/// one; data only ever lives on the owning node
pub struct DArrayManager {
    view: DArrayManagerView,
    metas: DashMap<ArrayId, DArrayMeta>,
    parts: DashMap<ArrayId, Arc<PartStore>>,
    next_array_seq: AtomicU32,

    rpc_caller_install_part: RPCCaller<msgs::InstallPartReq>,
    rpc_caller_fetch_slice: RPCCaller<msgs::FetchSliceReq>,
    rpc_caller_drop_part: RPCCaller<msgs::DropPartReq>,

    rpc_handler_install_part: RPCHandler<msgs::InstallPartReq>,
    rpc_handler_fetch_slice: RPCHandler<msgs::FetchSliceReq>,
    rpc_handler_drop_part: RPCHandler<msgs::DropPartReq>,
}

#[async_trait]
impl LogicalModule for DArrayManager {
    fn inner_new(args: LogicalModuleNewArgs) -> Self
    where
        Self: Sized,
    {
        Self {
            view: DArrayManagerView::new(args.logical_modules_ref.clone()),
            metas: DashMap::new(),
            parts: DashMap::new(),
            next_array_seq: AtomicU32::new(0),
            rpc_caller_install_part: RPCCaller::new(),
            rpc_caller_fetch_slice: RPCCaller::new(),
            rpc_caller_drop_part: RPCCaller::new(),
            rpc_handler_install_part: RPCHandler::new(),
            rpc_handler_fetch_slice: RPCHandler::new(),
            rpc_handler_drop_part: RPCHandler::new(),
        }
    }

    async fn start(&self) -> DmResult<Vec<JoinHandleWrapper>> {
        self.rpc_caller_install_part.regist(self.view.p2p());
        self.rpc_caller_fetch_slice.regist(self.view.p2p());
        self.rpc_caller_drop_part.regist(self.view.p2p());

        let view = self.view.clone();
        self.rpc_handler_install_part.regist(
            self.view.p2p(),
            move |responsor, req: msgs::InstallPartReq| {
                let view = view.clone();
                let _ = tokio::spawn(async move {
                    view.darray_manager()
                        .handle_install_part(responsor, req)
                        .await;
                });
                Ok(())
            },
        );

        let view = self.view.clone();
        self.rpc_handler_fetch_slice.regist(
            self.view.p2p(),
            move |responsor, req: msgs::FetchSliceReq| {
                let view = view.clone();
                let _ = tokio::spawn(async move {
                    view.darray_manager()
                        .handle_fetch_slice(responsor, req)
                        .await;
                });
                Ok(())
            },
        );

        let view = self.view.clone();
        self.rpc_handler_drop_part.regist(
            self.view.p2p(),
            move |responsor, req: msgs::DropPartReq| {
                let view = view.clone();
                let _ = tokio::spawn(async move {
                    view.darray_manager().handle_drop_part(responsor, req).await;
                });
                Ok(())
            },
        );

        Ok(vec![])
    }
}

/// block partitioning: cut the longest axis into one contiguous chunk
/// per worker, earlier chunks take the remainder
pub fn plan_partitions(shape: &[usize], workers: &[NodeID]) -> DmResult<Vec<NodePart>> {
    if workers.is_empty() {
        return Err(DmDataErr::NoWorkerNode.into());
    }
    if shape.is_empty() {
        // zero dimensional, single element on the first worker
        return Ok(vec![NodePart {
            node_id: workers[0],
            range: vec![],
        }]);
    }
    let cut_axis = shape
        .iter()
        .enumerate()
        .max_by_key(|(_, &len)| len)
        .map(|(i, _)| i)
        .unwrap();
    let cut_len = shape[cut_axis];
    let nchunks = workers.len().min(cut_len);
    let mut parts = Vec::with_capacity(nchunks);
    let mut begin = 0;
    for (i, node_id) in workers[..nchunks].iter().enumerate() {
        let len = cut_len / nchunks + if i < cut_len % nchunks { 1 } else { 0 };
        let range = shape
            .iter()
            .enumerate()
            .map(|(d, &dlen)| {
                if d == cut_axis {
                    DimRange::new(begin, begin + len)
                } else {
                    DimRange::whole(dlen)
                }
            })
            .collect();
        parts.push(NodePart {
            node_id: *node_id,
            range,
        });
        begin += len;
    }
    Ok(parts)
}

impl DArrayManager {
    fn alloc_array_id(&self) -> ArrayId {
        let seq = self.next_array_seq.fetch_add(1, Ordering::Relaxed);
        ((self.view.p2p().nodes_config.this_node() as u64) << 32) | seq as u64
    }

    /// lay out a fresh array over the worker set; storage appears on
    /// the workers later (install or materialize)
    pub fn alloc_empty(&self, shape: Vec<usize>) -> DmResult<DArrayMeta> {
        let workers = self.view.p2p().nodes_config.worker_nodes_sorted();
        let parts = plan_partitions(&shape, &workers)?;
        Ok(DArrayMeta {
            unique_id: self.alloc_array_id(),
            shape,
            parts,
        })
    }

    /// explicit partitioning of a plain local array: slice one block
    /// per owner and install them concurrently
    pub async fn distribute(&self, local: LocalArray) -> DmResult<DArrayMeta> {
        let meta = self.alloc_empty(local.shape.clone())?;
        tracing::debug!(
            "distributing array {} shape {:?} over {} parts",
            meta.unique_id,
            meta.shape,
            meta.parts.len()
        );
        let p2p = self.view.p2p();
        let mut futs = Vec::with_capacity(meta.parts.len());
        for part in &meta.parts {
            let part_dims = region_shape(&part.range);
            let mut data = vec![0.0; region_len(&part.range)];
            copy_region(
                &local.data,
                &local.shape,
                &part.range,
                &mut data,
                &part_dims,
                &region_of_shape(&part_dims),
            );
            futs.push(self.rpc_caller_install_part.call(
                p2p,
                part.node_id,
                msgs::InstallPartReq {
                    meta: meta.clone(),
                    data,
                },
                None,
            ));
        }
        let results = futures::future::join_all(futs).await;
        for (part, res) in meta.parts.iter().zip(results) {
            let resp = res?;
            if !resp.ok {
                return Err(DmDataErr::RemoteDataOp {
                    node: part.node_id,
                    reason: resp.msg,
                }
                .into());
            }
        }
        let _ = self.metas.insert(meta.unique_id, meta.clone());
        Ok(meta)
    }

    pub fn register_meta(&self, meta: DArrayMeta) {
        let _ = self.metas.insert(meta.unique_id, meta);
    }

    pub fn meta_of(&self, unique_id: ArrayId) -> Option<DArrayMeta> {
        self.metas.get(&unique_id).map(|m| m.value().clone())
    }

    /// valid only on the owning node
    pub fn local_part(&self, unique_id: ArrayId) -> Option<Arc<PartStore>> {
        self.parts.get(&unique_id).map(|p| p.value().clone())
    }

    /// install this node's partition, used by the install rpc and by
    /// the materializer producing a partition in place
    pub fn install_local_part(&self, meta: &DArrayMeta, data: Vec<f64>) -> DmResult<()> {
        let this = self.view.p2p().nodes_config.this_node();
        let part = meta.part_of(this).ok_or(DmDataErr::PartNotOnThisNode {
            unique_id: meta.unique_id,
            node: this,
        })?;
        let expect = region_len(&part.range);
        if data.len() != expect {
            return Err(DmDataErr::PartDataLenNotMatch {
                unique_id: meta.unique_id,
                expect,
                actual: data.len(),
            }
            .into());
        }
        let _ = self.metas.insert(meta.unique_id, meta.clone());
        let _ = self.parts.insert(
            meta.unique_id,
            Arc::new(PartStore {
                range: part.range.clone(),
                data: RwLock::new(data),
            }),
        );
        Ok(())
    }

    /// write a computed block into this node's own partition; the
    /// region must nest inside the owned range, never outside it
    pub fn write_into_part(
        &self,
        unique_id: ArrayId,
        global_region: &[DimRange],
        block: &[f64],
    ) -> DmResult<()> {
        let this = self.view.p2p().nodes_config.this_node();
        let store = self
            .parts
            .get(&unique_id)
            .map(|p| p.value().clone())
            .ok_or(DmDataErr::ArrayNotFound {
                unique_id,
                context: "write into part".to_owned(),
            })?;
        if !region_nested_in(global_region, &store.range) {
            return Err(DmDataErr::WriteRangeNotOwned {
                unique_id,
                node: this,
                range: global_region.to_vec(),
            }
            .into());
        }
        let local = region_to_relative(global_region, &store.range);
        let dims = region_shape(global_region);
        let store_dims = region_shape(&store.range);
        let mut guard = store.data.write();
        copy_region(
            block,
            &dims,
            &region_of_shape(&dims),
            &mut guard,
            &store_dims,
            &local,
        );
        Ok(())
    }

    /// read a sub range of this node's own partition
    fn fetch_local_slice(&self, unique_id: ArrayId, range: &[DimRange]) -> DmResult<Vec<f64>> {
        let this = self.view.p2p().nodes_config.this_node();
        let store = self
            .parts
            .get(&unique_id)
            .map(|p| p.value().clone())
            .ok_or(DmDataErr::ArrayNotFound {
                unique_id,
                context: "fetch slice".to_owned(),
            })?;
        if !region_nested_in(range, &store.range) {
            return Err(DmDataErr::FetchRangeNotOwned {
                unique_id,
                node: this,
                range: range.to_vec(),
            }
            .into());
        }
        let local = region_to_relative(range, &store.range);
        let dims = region_shape(range);
        let mut out = vec![0.0; region_len(range)];
        let guard = store.data.read();
        copy_region(
            &guard,
            &region_shape(&store.range),
            &local,
            &mut out,
            &dims,
            &region_of_shape(&dims),
        );
        Ok(out)
    }

    /// assemble an arbitrary global region: same node data is read
    /// directly, every foreign overlapped sub range is fetched
    /// concurrently and copied into place
    pub async fn fetch_region_assembled(
        &self,
        meta: &DArrayMeta,
        region: &[DimRange],
    ) -> DmResult<Vec<f64>> {
        let this = self.view.p2p().nodes_config.this_node();
        let out_dims = region_shape(region);
        let mut out = vec![0.0; region_len(region)];
        let p2p = self.view.p2p();

        let mut fetches = Vec::new();
        for part in &meta.parts {
            let isect = region_intersect(&part.range, region);
            if region_is_empty(&isect) {
                continue;
            }
            if part.node_id == this {
                let slice = self.fetch_local_slice(meta.unique_id, &isect)?;
                copy_region(
                    &slice,
                    &region_shape(&isect),
                    &region_of_shape(&region_shape(&isect)),
                    &mut out,
                    &out_dims,
                    &region_to_relative(&isect, region),
                );
            } else {
                let node_id = part.node_id;
                let unique_id = meta.unique_id;
                fetches.push(async move {
                    let res = self
                        .rpc_caller_fetch_slice
                        .call(
                            p2p,
                            node_id,
                            msgs::FetchSliceReq {
                                unique_id,
                                range: isect.clone(),
                            },
                            None,
                        )
                        .await;
                    (node_id, isect, res)
                });
            }
        }
        let results = futures::future::join_all(fetches).await;
        for (node_id, isect, res) in results {
            let resp = res?;
            if !resp.ok {
                return Err(DmDataErr::RemoteDataOp {
                    node: node_id,
                    reason: resp.msg,
                }
                .into());
            }
            copy_region(
                &resp.data,
                &region_shape(&isect),
                &region_of_shape(&region_shape(&isect)),
                &mut out,
                &out_dims,
                &region_to_relative(&isect, region),
            );
        }
        Ok(out)
    }

    /// pull the whole array back to the calling node
    pub async fn gather(&self, meta: &DArrayMeta) -> DmResult<LocalArray> {
        let data = self
            .fetch_region_assembled(meta, &region_of_shape(&meta.shape))
            .await?;
        LocalArray::new(meta.shape.clone(), data)
    }

    /// partitions are freed together with the whole array
    pub async fn drop_array(&self, meta: &DArrayMeta) -> DmResult<()> {
        let p2p = self.view.p2p();
        let futs: Vec<_> = meta
            .parts
            .iter()
            .map(|part| {
                self.rpc_caller_drop_part.call(
                    p2p,
                    part.node_id,
                    msgs::DropPartReq {
                        unique_id: meta.unique_id,
                    },
                    None,
                )
            })
            .collect();
        let results = futures::future::join_all(futs).await;
        let _ = self.metas.remove(&meta.unique_id);
        for res in results {
            let _ = res?;
        }
        Ok(())
    }

    async fn handle_install_part(
        &self,
        responsor: RPCResponsor<msgs::InstallPartReq>,
        req: msgs::InstallPartReq,
    ) {
        let resp = match self.install_local_part(&req.meta, req.data) {
            Ok(()) => msgs::InstallPartResp {
                ok: true,
                msg: String::new(),
            },
            Err(err) => {
                tracing::warn!("install part failed: {:?}", err);
                msgs::InstallPartResp {
                    ok: false,
                    msg: format!("{:?}", err),
                }
            }
        };
        if let Err(err) = responsor.send_resp(resp).await {
            tracing::error!("send install part resp failed: {:?}", err);
        }
    }

    async fn handle_fetch_slice(
        &self,
        responsor: RPCResponsor<msgs::FetchSliceReq>,
        req: msgs::FetchSliceReq,
    ) {
        let resp = match self.fetch_local_slice(req.unique_id, &req.range) {
            Ok(data) => msgs::FetchSliceResp {
                ok: true,
                msg: String::new(),
                data,
            },
            Err(err) => {
                tracing::warn!("fetch slice failed: {:?}", err);
                msgs::FetchSliceResp {
                    ok: false,
                    msg: format!("{:?}", err),
                    data: vec![],
                }
            }
        };
        if let Err(err) = responsor.send_resp(resp).await {
            tracing::error!("send fetch slice resp failed: {:?}", err);
        }
    }

    async fn handle_drop_part(
        &self,
        responsor: RPCResponsor<msgs::DropPartReq>,
        req: msgs::DropPartReq,
    ) {
        let _ = self.parts.remove(&req.unique_id);
        let _ = self.metas.remove(&req.unique_id);
        if let Err(err) = responsor
            .send_resp(msgs::DropPartResp { ok: true })
            .await
        {
            tracing::error!("send drop part resp failed: {:?}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{general::test_utils, result::DmError};

    // for every dimension the owned ranges must tile the full extent
    // with no gaps and no overlaps
    fn check_cover(shape: &[usize], parts: &[NodePart]) {
        for part in parts {
            assert_eq!(part.range.len(), shape.len());
        }
        let total: usize = parts.iter().map(|p| region_len(&p.range)).sum();
        assert_eq!(total, shape.iter().product::<usize>());
        for (i, a) in parts.iter().enumerate() {
            for b in parts.iter().skip(i + 1) {
                assert!(region_is_empty(&region_intersect(&a.range, &b.range)));
            }
        }
        for d in 0..shape.len() {
            let mut edges: Vec<(usize, usize)> =
                parts.iter().map(|p| (p.range[d].begin, p.range[d].end)).collect();
            edges.sort_unstable();
            edges.dedup();
            assert_eq!(edges.first().unwrap().0, 0);
            assert_eq!(edges.last().unwrap().1, shape[d]);
        }
    }

    #[test]
    fn test_partition_cover() {
        for (shape, workers) in [
            (vec![10], vec![2, 3, 5]),
            (vec![3, 4], vec![2, 3]),
            (vec![7, 2], vec![2, 3, 5]),
            (vec![1, 9], vec![2, 3]),
            (vec![2, 2, 2], vec![2, 3, 5, 7]),
        ] {
            let parts = plan_partitions(&shape, &workers).unwrap();
            check_cover(&shape, &parts);
            // one part per worker at most
            let mut owners: Vec<_> = parts.iter().map(|p| p.node_id).collect();
            owners.dedup();
            assert_eq!(owners.len(), parts.len());
        }
    }

    #[test]
    fn test_partition_more_workers_than_rows() {
        let parts = plan_partitions(&[2], &[1, 2, 3, 4]).unwrap();
        assert_eq!(parts.len(), 2);
        check_cover(&[2], &parts);
    }

    #[test]
    fn test_partition_zero_dim_and_no_worker() {
        let parts = plan_partitions(&[], &[2, 3]).unwrap();
        assert_eq!(parts.len(), 1);
        assert!(parts[0].range.is_empty());
        assert!(plan_partitions(&[4], &[]).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_outside_owned_range_rejected() {
        let cluster = test_utils::start_test_cluster().await;
        let coord = DArrayManagerView::new(cluster.coord());
        let meta = coord
            .darray_manager()
            .distribute(LocalArray::new(vec![4], vec![0.0; 4]).unwrap())
            .await
            .unwrap();

        // first worker owns [0,2); writing [1,3) crosses into the
        // second worker's range and must be refused
        let worker = DArrayManagerView::new(cluster.node(1));
        let res =
            worker
                .darray_manager()
                .write_into_part(meta.unique_id, &[DimRange::new(1, 3)], &[9.0, 9.0]);
        assert!(matches!(
            res,
            Err(DmError::DmDataErr(DmDataErr::WriteRangeNotOwned { .. }))
        ));

        // a nested write lands
        worker
            .darray_manager()
            .write_into_part(meta.unique_id, &[DimRange::new(0, 2)], &[7.0, 8.0])
            .unwrap();
        let gathered = coord.darray_manager().gather(&meta).await.unwrap();
        assert_eq!(gathered.data[0..2], [7.0, 8.0][..]);
        assert_eq!(gathered.data[2..4], [0.0, 0.0][..]);
    }
}
