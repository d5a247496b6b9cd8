use futures::future::{BoxFuture, join_all};
use tokio::sync::oneshot;

use crate::error::{Result, VolumeError};

type Interpret = Box<dyn FnOnce(Result<()>) -> BoxFuture<'static, Result<()>> + Send>;

/// Batch of remote calls owned by the caller.
///
/// Operations add their sub-calls and register a continuation; nothing runs
/// until [`wait`](CallSet::wait). Several operations may share one set: every
/// call settles first, then each continuation runs once, in registration
/// order, with the set's aggregate status.
#[derive(Default)]
pub struct CallSet {
    calls: Vec<BoxFuture<'static, Result<()>>>,
    interpret: Vec<Interpret>,
}

impl CallSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, call: BoxFuture<'static, Result<()>>) {
        self.calls.push(call);
    }

    pub fn set_interpret(&mut self, f: Interpret) {
        self.interpret.push(f);
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Runs every call concurrently, then the continuations. Returns the
    /// first error seen in call order, or the first continuation error.
    pub async fn wait(self) -> Result<()> {
        let mut status = Ok(());
        for res in join_all(self.calls).await {
            if let Err(err) = res {
                if status.is_ok() {
                    status = Err(err);
                }
            }
        }
        for interpret in self.interpret {
            let rc = interpret(status.clone()).await;
            if status.is_ok() {
                status = rc;
            }
        }
        status
    }
}

/// Logical result of an operation dispatched onto a [`CallSet`]. Resolves
/// once the set has been waited on.
pub struct AsyncReply<R> {
    rx: oneshot::Receiver<Result<R>>,
}

impl<R> AsyncReply<R> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<R>>) -> Self {
        Self { rx }
    }

    pub async fn wait(self) -> Result<R> {
        self.rx
            .await
            .map_err(|_| VolumeError::Io("call set dropped before completion".into()))?
    }
}
