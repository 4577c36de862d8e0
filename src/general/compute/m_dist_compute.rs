use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::future::join_all;

use super::{
    eval::{eval_local, ElemFunc},
    plan::{Operand, PlanNode},
    reduce::reduce_plan,
};
use crate::{
    general::{
        data::{
            darray::{DArrayMeta, DArrayView},
            m_darray_manager::DArrayManager,
            shape::{
                region_from_relative, region_intersect, region_is_empty, region_shape,
                region_to_relative,
            },
        },
        network::{
            m_p2p::{P2PModule, RPCCaller, RPCHandler, RPCResponsor},
            msgs,
        },
    },
    logical_module_view_impl,
    result::{DmComputeErr, DmError, DmResult, DmShapeErr},
    sys::{LogicalModule, LogicalModuleNewArgs},
    util::JoinHandleWrapper,
};

logical_module_view_impl!(DistComputeView);
logical_module_view_impl!(DistComputeView, p2p, P2PModule);
logical_module_view_impl!(DistComputeView, darray_manager, DArrayManager);
logical_module_view_impl!(DistComputeView, dist_compute, DistCompute);

/// elementwise operations over distributed arrays: builds the plan on
/// the driving node, fans one unit out per owning worker, joins at
/// the barrier; the worker side reduces and evaluates
pub struct DistCompute {
    view: DistComputeView,
    dispatched_units: AtomicU64,

    rpc_caller_execute_unit: RPCCaller<msgs::ExecuteUnitReq>,
    rpc_caller_materialize_unit: RPCCaller<msgs::MaterializeUnitReq>,

    rpc_handler_execute_unit: RPCHandler<msgs::ExecuteUnitReq>,
    rpc_handler_materialize_unit: RPCHandler<msgs::MaterializeUnitReq>,
}

#[async_trait]
impl LogicalModule for DistCompute {
    fn inner_new(args: LogicalModuleNewArgs) -> Self
    where
        Self: Sized,
    {
        Self {
            view: DistComputeView::new(args.logical_modules_ref.clone()),
            dispatched_units: AtomicU64::new(0),
            rpc_caller_execute_unit: RPCCaller::new(),
            rpc_caller_materialize_unit: RPCCaller::new(),
            rpc_handler_execute_unit: RPCHandler::new(),
            rpc_handler_materialize_unit: RPCHandler::new(),
        }
    }

    async fn start(&self) -> DmResult<Vec<JoinHandleWrapper>> {
        self.rpc_caller_execute_unit.regist(self.view.p2p());
        self.rpc_caller_materialize_unit.regist(self.view.p2p());

        let view = self.view.clone();
        self.rpc_handler_execute_unit.regist(
            self.view.p2p(),
            move |responsor, req: msgs::ExecuteUnitReq| {
                let view = view.clone();
                let _ = tokio::spawn(async move {
                    view.dist_compute()
                        .handle_execute_unit(responsor, req)
                        .await;
                });
                Ok(())
            },
        );

        let view = self.view.clone();
        self.rpc_handler_materialize_unit.regist(
            self.view.p2p(),
            move |responsor, req: msgs::MaterializeUnitReq| {
                let view = view.clone();
                let _ = tokio::spawn(async move {
                    view.dist_compute()
                        .handle_materialize_unit(responsor, req)
                        .await;
                });
                Ok(())
            },
        );

        Ok(vec![])
    }
}

impl DistCompute {
    /// units fanned out since node start, tests watch the delta
    pub fn dispatched_unit_cnt(&self) -> u64 {
        self.dispatched_units.load(Ordering::Relaxed)
    }

    /// operand type normalization, once per invocation on the driving
    /// node: array shaped local leaves become distributed, scalars and
    /// zero dim values pass through, no compute happens here
    pub async fn build_plan(&self, node: PlanNode) -> DmResult<PlanNode> {
        match node {
            PlanNode::Leaf(Operand::Local(arr)) if arr.ndim() > 0 => {
                let meta = self.view.darray_manager().distribute(arr).await?;
                Ok(PlanNode::dist(meta))
            }
            PlanNode::Leaf(leaf) => Ok(PlanNode::Leaf(leaf)),
            PlanNode::Op {
                func,
                shape,
                children,
            } => {
                let mut built = Vec::with_capacity(children.len());
                for c in children {
                    built.push(Box::pin(self.build_plan(c)).await?);
                }
                Ok(PlanNode::Op {
                    func,
                    shape,
                    children: built,
                })
            }
        }
    }

    /// non destructive form: a fresh distributed array, every
    /// partition produced in place on its owner
    pub async fn apply(&self, func: ElemFunc, operands: Vec<PlanNode>) -> DmResult<DArrayMeta> {
        let root = PlanNode::op(func, operands)?;
        self.apply_tree(root).await
    }

    pub async fn apply_tree(&self, root: PlanNode) -> DmResult<DArrayMeta> {
        let plan = self.build_plan(root).await?;
        let meta = self
            .view
            .darray_manager()
            .alloc_empty(plan.shape().to_vec())?;
        tracing::debug!(
            "materializing array {} shape {:?} over {} parts",
            meta.unique_id,
            meta.shape,
            meta.parts.len()
        );
        let p2p = self.view.p2p();
        let mut nodes = Vec::with_capacity(meta.parts.len());
        let mut futs = Vec::with_capacity(meta.parts.len());
        for part in &meta.parts {
            let _ = self.dispatched_units.fetch_add(1, Ordering::Relaxed);
            nodes.push(part.node_id);
            futs.push(self.rpc_caller_materialize_unit.call(
                p2p,
                part.node_id,
                msgs::MaterializeUnitReq {
                    meta: meta.clone(),
                    plan: plan.clone(),
                },
                None,
            ));
        }
        let results = join_all(futs).await;
        let mut first_err: Option<DmError> = None;
        for (node, res) in nodes.into_iter().zip(results) {
            match res {
                Ok(resp) if resp.ok => {}
                Ok(resp) => {
                    if first_err.is_none() {
                        first_err = Some(
                            DmComputeErr::RemoteExecution {
                                node,
                                reason: resp.msg,
                            }
                            .into(),
                        );
                    }
                }
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }
        self.view.darray_manager().register_meta(meta.clone());
        Ok(meta)
    }

    /// destructive form: write into an existing array or a sub view
    /// of one; the destination's shape must equal the unified shape
    /// exactly
    pub async fn apply_into(
        &self,
        dest: &DArrayView,
        func: ElemFunc,
        operands: Vec<PlanNode>,
    ) -> DmResult<()> {
        let root = PlanNode::op(func, operands)?;
        self.apply_tree_into(dest, root).await
    }

    pub async fn apply_tree_into(&self, dest: &DArrayView, root: PlanNode) -> DmResult<()> {
        if dest.shape().as_slice() != root.shape() {
            return Err(DmShapeErr::DestShapeNotEqual {
                unified: root.shape().to_vec(),
                dest: dest.shape(),
            }
            .into());
        }
        let plan = self.build_plan(root).await?;
        let p2p = self.view.p2p();
        let mut nodes = Vec::new();
        let mut futs = Vec::new();
        for part in &dest.meta.parts {
            let isect = region_intersect(&part.range, &dest.range);
            if region_is_empty(&isect) {
                // owner not covered by the destination: no unit at all
                continue;
            }
            let unit_range = region_to_relative(&isect, &dest.range);
            let _ = self.dispatched_units.fetch_add(1, Ordering::Relaxed);
            nodes.push(part.node_id);
            futs.push(self.rpc_caller_execute_unit.call(
                p2p,
                part.node_id,
                msgs::ExecuteUnitReq {
                    plan: plan.clone(),
                    dest_meta: dest.meta.clone(),
                    dest_range: dest.range.clone(),
                    unit_range,
                },
                None,
            ));
        }
        tracing::debug!(
            "apply_into array {} dispatched {} units",
            dest.meta.unique_id,
            nodes.len()
        );
        let results = join_all(futs).await;
        let mut first_err: Option<DmError> = None;
        for (node, res) in nodes.into_iter().zip(results) {
            match res {
                Ok(resp) if resp.ok => {}
                Ok(resp) => {
                    if first_err.is_none() {
                        first_err = Some(
                            DmComputeErr::RemoteExecution {
                                node,
                                reason: resp.msg,
                            }
                            .into(),
                        );
                    }
                }
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        match first_err {
            // writes of non failing workers are not rolled back
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn execute_unit_inner(&self, req: &msgs::ExecuteUnitReq) -> DmResult<()> {
        let local_tree = reduce_plan(self.view.darray_manager(), &req.plan, &req.unit_range).await?;
        let out = eval_local(&local_tree, &region_shape(&req.unit_range))?;
        let global = region_from_relative(&req.unit_range, &req.dest_range);
        self.view
            .darray_manager()
            .write_into_part(req.dest_meta.unique_id, &global, &out)
    }

    async fn handle_execute_unit(
        &self,
        responsor: RPCResponsor<msgs::ExecuteUnitReq>,
        req: msgs::ExecuteUnitReq,
    ) {
        let resp = match self.execute_unit_inner(&req).await {
            Ok(()) => msgs::ExecuteUnitResp {
                ok: true,
                msg: String::new(),
            },
            Err(err) => {
                tracing::warn!("execute unit failed: {:?}", err);
                msgs::ExecuteUnitResp {
                    ok: false,
                    msg: format!("{:?}", err),
                }
            }
        };
        if let Err(err) = responsor.send_resp(resp).await {
            tracing::error!("send execute unit resp failed: {:?}", err);
        }
    }

    async fn materialize_unit_inner(&self, req: &msgs::MaterializeUnitReq) -> DmResult<()> {
        let this = self.view.p2p().nodes_config.this_node();
        let part = req
            .meta
            .part_of(this)
            .ok_or(crate::result::DmDataErr::PartNotOnThisNode {
                unique_id: req.meta.unique_id,
                node: this,
            })?
            .clone();
        // own owned range in the array's global coords, which is the
        // plan's coordinate system for a whole array destination
        let local_tree = reduce_plan(self.view.darray_manager(), &req.plan, &part.range).await?;
        let out = eval_local(&local_tree, &region_shape(&part.range))?;
        self.view.darray_manager().install_local_part(&req.meta, out)
    }

    async fn handle_materialize_unit(
        &self,
        responsor: RPCResponsor<msgs::MaterializeUnitReq>,
        req: msgs::MaterializeUnitReq,
    ) {
        let resp = match self.materialize_unit_inner(&req).await {
            Ok(()) => msgs::MaterializeUnitResp {
                ok: true,
                msg: String::new(),
            },
            Err(err) => {
                tracing::warn!("materialize unit failed: {:?}", err);
                msgs::MaterializeUnitResp {
                    ok: false,
                    msg: format!("{:?}", err),
                }
            }
        };
        if let Err(err) = responsor.send_resp(resp).await {
            tracing::error!("send materialize unit resp failed: {:?}", err);
        }
    }
}

#[cfg(test)]
mod test {
    use super::DistComputeView;
    use crate::{
        general::{
            compute::{eval::ElemFunc, plan::PlanNode},
            data::{
                darray::{DArrayView, LocalArray},
                shape::DimRange,
            },
            test_utils,
        },
        result::{DmComputeErr, DmError, DmShapeErr},
    };

    #[tokio::test(flavor = "multi_thread")]
    async fn test_plan_builder_distributes_local_leaves() {
        let cluster = test_utils::start_test_cluster().await;
        let view = DistComputeView::new(cluster.coord());

        let root = PlanNode::op(
            ElemFunc::Add,
            vec![
                PlanNode::local(LocalArray::new(vec![4], vec![0.0; 4]).unwrap()),
                PlanNode::op(
                    ElemFunc::Mul,
                    vec![
                        PlanNode::local(LocalArray::new(vec![1, 4], vec![0.0; 4]).unwrap()),
                        PlanNode::scalar(3.0),
                    ],
                )
                .unwrap(),
                PlanNode::local(LocalArray::zero_dim(2.0)),
            ],
        )
        .unwrap();
        let plan = view.dist_compute().build_plan(root).await.unwrap();

        // array shaped local leaves became distributed, scalars and the
        // zero dim local passed through, target axes untouched
        fn check(node: &PlanNode) {
            match node {
                PlanNode::Leaf(op) => assert!(
                    op.as_dist().is_some()
                        || op.as_scalar().is_some()
                        || op.as_local().is_some_and(|a| a.ndim() == 0)
                ),
                PlanNode::Op { children, .. } => children.iter().for_each(check),
            }
        }
        check(&plan);
        assert_eq!(plan.shape(), &[1, 4]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_apply_broadcast_outer_sum() {
        let cluster = test_utils::start_test_cluster().await;
        let view = DistComputeView::new(cluster.coord());

        // (3,1) + (1,4): the two operands and the result all get cut
        // along different axes, so worker side foreign fetches span
        // partition boundaries
        let a = LocalArray::new(vec![3, 1], vec![1.0, 2.0, 3.0]).unwrap();
        let b = LocalArray::new(vec![1, 4], vec![10.0; 4]).unwrap();
        let meta = view
            .dist_compute()
            .apply(
                ElemFunc::Add,
                vec![PlanNode::local(a), PlanNode::local(b)],
            )
            .await
            .unwrap();
        assert_eq!(meta.shape, vec![3, 4]);

        let gathered = view.darray_manager().gather(&meta).await.unwrap();
        for i in 0..3 {
            for j in 0..4 {
                assert_eq!(gathered.data[i * 4 + j], (i + 1) as f64 + 10.0);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_apply_nested_tree_with_scalar() {
        let cluster = test_utils::start_test_cluster().await;
        let view = DistComputeView::new(cluster.coord());

        // (a * 2) + 1 over a distributed operand reused from apply
        let a = LocalArray::new(vec![6], (0..6).map(|v| v as f64).collect()).unwrap();
        let dist_a = view.darray_manager().distribute(a).await.unwrap();
        let inner = PlanNode::op(
            ElemFunc::Mul,
            vec![PlanNode::dist(dist_a.clone()), PlanNode::scalar(2.0)],
        )
        .unwrap();
        let root = PlanNode::op(
            ElemFunc::Add,
            vec![
                inner,
                PlanNode::local(LocalArray::zero_dim(1.0)),
            ],
        )
        .unwrap();
        let meta = view.dist_compute().apply_tree(root).await.unwrap();
        let gathered = view.darray_manager().gather(&meta).await.unwrap();
        assert_eq!(gathered.data, vec![1.0, 3.0, 5.0, 7.0, 9.0, 11.0]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_apply_into_view_matches_whole_apply() {
        let cluster = test_utils::start_test_cluster().await;
        let view = DistComputeView::new(cluster.coord());

        let la: Vec<f64> = (0..16).map(|v| v as f64).collect();
        let lb: Vec<f64> = (0..16).map(|v| (v * 3) as f64).collect();

        // whole array reference result
        let whole = view
            .dist_compute()
            .apply(
                ElemFunc::Add,
                vec![
                    PlanNode::local(LocalArray::new(vec![4, 4], la.clone()).unwrap()),
                    PlanNode::local(LocalArray::new(vec![4, 4], lb.clone()).unwrap()),
                ],
            )
            .await
            .unwrap();
        let whole_data = view.darray_manager().gather(&whole).await.unwrap().data;

        // same computation restricted to rows 1..3 written through a view
        let dest = view
            .darray_manager()
            .distribute(LocalArray::new(vec![4, 4], vec![0.0; 16]).unwrap())
            .await
            .unwrap();
        let sub_rows = DimRange::new(1, 3);
        let dest_view = DArrayView::new(
            dest.clone(),
            vec![sub_rows, DimRange::whole(4)],
        )
        .unwrap();
        let sub = |src: &[f64]| -> LocalArray {
            LocalArray::new(vec![2, 4], src[4..12].to_vec()).unwrap()
        };
        view.dist_compute()
            .apply_into(
                &dest_view,
                ElemFunc::Add,
                vec![
                    PlanNode::local(sub(&la)),
                    PlanNode::local(sub(&lb)),
                ],
            )
            .await
            .unwrap();

        let dest_data = view.darray_manager().gather(&dest).await.unwrap().data;
        // inside the view: identical to the whole array result
        assert_eq!(dest_data[4..12], whole_data[4..12]);
        // outside the view: untouched
        assert_eq!(dest_data[0..4], vec![0.0; 4][..]);
        assert_eq!(dest_data[12..16], vec![0.0; 4][..]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shape_mismatch_is_fail_fast() {
        let cluster = test_utils::start_test_cluster().await;
        let view = DistComputeView::new(cluster.coord());

        let before = view.dist_compute().dispatched_unit_cnt();
        let res = view
            .dist_compute()
            .apply(
                ElemFunc::Add,
                vec![
                    PlanNode::local(LocalArray::new(vec![2, 3], vec![0.0; 6]).unwrap()),
                    PlanNode::local(LocalArray::new(vec![2, 4], vec![0.0; 8]).unwrap()),
                ],
            )
            .await;
        assert!(matches!(
            res,
            Err(DmError::DmShapeErr(DmShapeErr::ShapeMismatch { .. }))
        ));
        // nothing was dispatched
        assert_eq!(view.dist_compute().dispatched_unit_cnt(), before);

        // destination must equal the unified shape exactly, broadcast
        // compatible is not enough
        let dest = view
            .darray_manager()
            .distribute(LocalArray::new(vec![3, 4], vec![0.0; 12]).unwrap())
            .await
            .unwrap();
        let res = view
            .dist_compute()
            .apply_into(
                &DArrayView::whole(dest),
                ElemFunc::Add,
                vec![
                    PlanNode::local(LocalArray::new(vec![1, 4], vec![0.0; 4]).unwrap()),
                    PlanNode::scalar(1.0),
                ],
            )
            .await;
        assert!(matches!(
            res,
            Err(DmError::DmShapeErr(DmShapeErr::DestShapeNotEqual { .. }))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failing_eval_surfaces_after_barrier() {
        let cluster = test_utils::start_test_cluster().await;
        let view = DistComputeView::new(cluster.coord());

        // divisor is zero only inside the second worker's rows, the
        // first worker's partition must keep its computed values
        let dest = view
            .darray_manager()
            .distribute(LocalArray::new(vec![4], vec![-1.0; 4]).unwrap())
            .await
            .unwrap();
        let num = LocalArray::new(vec![4], vec![8.0, 8.0, 8.0, 8.0]).unwrap();
        let den = LocalArray::new(vec![4], vec![2.0, 4.0, 0.0, 1.0]).unwrap();
        let res = view
            .dist_compute()
            .apply_into(
                &DArrayView::whole(dest.clone()),
                ElemFunc::Div,
                vec![PlanNode::local(num), PlanNode::local(den)],
            )
            .await;
        match res {
            Err(DmError::DmComputeErr(DmComputeErr::RemoteExecution { node, .. })) => {
                assert_eq!(node, dest.parts[1].node_id);
            }
            other => panic!("expect remote execution err, got {:?}", other),
        }
        let after = view.darray_manager().gather(&dest).await.unwrap().data;
        assert_eq!(after[0..2], vec![4.0, 2.0][..]);
        // failing worker's partition was never written
        assert_eq!(after[2..4], vec![-1.0, -1.0][..]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_subview_skips_non_intersecting_worker() {
        let cluster = test_utils::start_test_cluster().await;
        let view = DistComputeView::new(cluster.coord());

        let dest = view
            .darray_manager()
            .distribute(LocalArray::new(vec![4, 2], vec![0.0; 8]).unwrap())
            .await
            .unwrap();
        // rows 0..2 lie entirely inside the first worker's partition
        assert_eq!(dest.parts.len(), 2);
        assert_eq!(dest.parts[0].range[0], DimRange::new(0, 2));

        let dest_view = DArrayView::new(
            dest.clone(),
            vec![DimRange::new(0, 2), DimRange::whole(2)],
        )
        .unwrap();
        let before = view.dist_compute().dispatched_unit_cnt();
        view.dist_compute()
            .apply_into(
                &dest_view,
                ElemFunc::Add,
                vec![
                    PlanNode::local(LocalArray::new(vec![2, 2], vec![5.0; 4]).unwrap()),
                    PlanNode::scalar(1.0),
                ],
            )
            .await
            .unwrap();
        // one unit for the covered worker, zero for the other; the
        // operand distribute above dispatches install rpcs, not units
        assert_eq!(view.dist_compute().dispatched_unit_cnt(), before + 1);

        let after = view.darray_manager().gather(&dest).await.unwrap().data;
        assert_eq!(after[0..4], vec![6.0; 4][..]);
        assert_eq!(after[4..8], vec![0.0; 4][..]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_drop_array_frees_all_parts() {
        let cluster = test_utils::start_test_cluster().await;
        let view = DistComputeView::new(cluster.coord());

        let meta = view
            .darray_manager()
            .distribute(LocalArray::new(vec![6], vec![1.0; 6]).unwrap())
            .await
            .unwrap();
        assert!(view.darray_manager().gather(&meta).await.is_ok());
        view.darray_manager().drop_array(&meta).await.unwrap();
        // partitions are freed together, any later read fails
        assert!(view.darray_manager().gather(&meta).await.is_err());
    }
}
