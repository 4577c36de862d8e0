#[cfg(test)]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[cfg(test)]
pub fn test_tracing_start() {
    let my_filter = tracing_subscriber::filter::filter_fn(|v| v.level() != &tracing::Level::TRACE);
    let my_layer = tracing_subscriber::fmt::layer();
    let _ = tracing_subscriber::registry()
        .with(my_layer.with_filter(my_filter))
        .try_init();
}

pub enum JoinHandleWrapper {
    Task(Option<tokio::task::JoinHandle<()>>),
    Thread(Option<std::thread::JoinHandle<()>>),
}

impl From<tokio::task::JoinHandle<()>> for JoinHandleWrapper {
    fn from(handle: tokio::task::JoinHandle<()>) -> Self {
        Self::Task(handle.into())
    }
}

impl From<std::thread::JoinHandle<()>> for JoinHandleWrapper {
    fn from(handle: std::thread::JoinHandle<()>) -> Self {
        Self::Thread(handle.into())
    }
}

impl JoinHandleWrapper {
    pub async fn join(&mut self) {
        match self {
            Self::Task(handle) => handle.take().unwrap().await.unwrap(),
            Self::Thread(handle) => {
                let handle = handle.take().unwrap();
                tokio::task::spawn_blocking(|| handle.join().unwrap())
                    .await
                    .unwrap()
            }
        }
    }
}

pub unsafe fn unsafe_mut<T>(arc: &T) -> &mut T {
    unsafe { &mut *(arc as *const T as *mut T) }
}
