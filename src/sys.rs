use crate::{
    config::NodesConfig,
    general::{
        compute::m_dist_compute::DistCompute, data::m_darray_manager::DArrayManager,
        network::m_p2p::P2PModule,
    },
    util,
};
use crate::{result::DmResult, util::JoinHandleWrapper};
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;

pub struct Sys {
    logical_modules: Arc<Option<LogicalModules>>,
    sub_tasks: Mutex<Vec<JoinHandleWrapper>>,
}

impl Drop for Sys {
    fn drop(&mut self) {
        tracing::info!("drop sys");
    }
}

impl Sys {
    pub fn new(config: NodesConfig) -> Sys {
        tracing::info!("Running at dir: {:?}", config.file_dir);

        Sys {
            logical_modules: LogicalModules::new(config),
            sub_tasks: Vec::new().into(),
        }
    }

    pub fn new_logical_modules_ref(&self) -> LogicalModulesRef {
        LogicalModulesRef::new(self.logical_modules.clone())
    }

    pub async fn wait_for_end(&mut self) {
        if let Err(err) = (*self.logical_modules).as_ref().unwrap().start(self).await {
            panic!("start logical nodes error: {:?}", err);
        }
        tracing::info!("modules all started, waiting for end");
        for task in self.sub_tasks.lock().await.iter_mut() {
            task.join().await;
        }
    }

    #[cfg(test)]
    pub async fn test_start_all(&self) -> LogicalModulesRef {
        if let Err(err) = (*self.logical_modules).as_ref().unwrap().start(self).await {
            panic!("start logical nodes error: {:?}", err);
        }
        assert!(self.logical_modules.is_some());
        LogicalModulesRef {
            inner: Arc::downgrade(&self.logical_modules),
        }
    }
}

pub type NodeID = u32;

#[derive(Clone)]
pub struct LogicalModuleNewArgs {
    pub logical_modules_ref: LogicalModulesRef,
    pub parent_name: String,
    pub btx: BroadcastSender,
    pub nodes_config: NodesConfig,
}

impl LogicalModuleNewArgs {
    pub fn expand_parent_name(&mut self, this_name: &str) {
        let name = format!("{}::{}", self.parent_name, this_name);
        self.parent_name = name;
    }
}

#[async_trait]
pub trait LogicalModule: Send + Sync + 'static {
    fn inner_new(args: LogicalModuleNewArgs) -> Self
    where
        Self: Sized;
    fn new(args: LogicalModuleNewArgs) -> Self
    where
        Self: Sized,
    {
        Self::inner_new(args)
    }
    async fn start(&self) -> DmResult<Vec<JoinHandleWrapper>>;

    async fn init(&self) -> DmResult<()> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub enum BroadcastMsg {
    SysEnd,
}

pub type BroadcastSender = tokio::sync::broadcast::Sender<BroadcastMsg>;

#[derive(Clone)]
pub struct LogicalModulesRef {
    pub inner: Weak<Option<LogicalModules>>,
}

impl LogicalModulesRef {
    pub fn new(inner: Arc<Option<LogicalModules>>) -> LogicalModulesRef {
        let inner = Arc::downgrade(&inner);
        LogicalModulesRef { inner }
    }
}

#[macro_export]
macro_rules! logical_module_view_impl {
    ($module:ident,$module_name:ident,$type:ty) => {
        impl $module {
            pub fn $module_name(&self) -> &$type {
                let res = unsafe { &(*self.inner.inner.as_ptr()).as_ref().unwrap().$module_name };

                // compile time check that $type is Send
                let _: &dyn Send = res;

                res
            }
        }
    };
    ($module:ident) => {
        #[derive(Clone)]
        pub struct $module {
            inner: $crate::sys::LogicalModulesRef,
        }
        impl $module {
            pub fn new(inner: $crate::sys::LogicalModulesRef) -> Self {
                $module { inner }
            }
            pub fn copy_module_ref(&self) -> $crate::sys::LogicalModulesRef {
                self.inner.clone()
            }
        }

        // unsafe send
        unsafe impl Send for $module {}
    };
}

macro_rules! start_modules {
    ([$( $module:ident,$modulety:ty ),*]) => {
        pub struct LogicalModules {
            $( pub $module : $modulety, )*
        }

        impl LogicalModules {
            pub fn new(config: NodesConfig) -> Arc<Option<LogicalModules>> {
                let (broadcast_tx, _broadcast_rx) = tokio::sync::broadcast::channel::<BroadcastMsg>(1);
                let arc = Arc::new(None);
                let args = LogicalModuleNewArgs {
                    btx: broadcast_tx,
                    parent_name: "".to_owned(),
                    nodes_config: config.clone(),
                    logical_modules_ref: LogicalModulesRef {
                        inner: Arc::downgrade(&arc),
                    },
                };

                let logical_modules = LogicalModules {
                    $( $module : <$modulety>::new(args.clone()), )*
                };
                assert!(config.this.1.is_coord() || config.this.1.is_worker());
                let _ = unsafe { util::unsafe_mut(&*arc) }.replace(logical_modules);
                arc
            }
            pub async fn start(&self, sys: &Sys) -> DmResult<()> {
                $(
                    self.$module.init().await?;
                )*

                $(
                    sys.sub_tasks
                        .lock()
                        .await
                        .append(&mut self.$module.start().await?);
                )*
                Ok(())
            }
        }
    };
}

start_modules!([
    p2p,
    P2PModule,
    darray_manager,
    DArrayManager,
    dist_compute,
    DistCompute
]);
