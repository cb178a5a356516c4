use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, future::BoxFuture};
use log::{error, warn};
use moka::future::Cache;
use oci_spec::image::Descriptor;
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// What `pre` decided about a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreVisit {
    /// Walk these children, then run `post`. An empty list is a leaf.
    Children(Vec<Descriptor>),
    /// Prune the subtree: no children, no `post`.
    SkipNode,
    /// Treat the node as a leaf and stop launching its younger siblings.
    SkipSiblings,
}

#[async_trait]
pub trait Handler: Send + Sync {
    /// Runs before a node's children. Strictly happens-before the `pre` of
    /// every child on the same branch.
    async fn pre(&self, desc: &Descriptor) -> Result<PreVisit, Error>;

    /// Runs once every descendant has completed, so guarantees about the
    /// subtree hold here.
    async fn post(&self, desc: &Descriptor) -> Result<(), Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Done,
    SkipSiblings,
}

// Concurrent DAG traversal with per-digest deduplication. The statuses map
// is the get-or-insert-future primitive: the first worker to reach a digest
// inserts the in-flight visit, everyone else awaits that same future, so
// pre runs at most once and post exactly once per digest per walk. Branches
// that share a child therefore converge instead of re-walking it.
pub struct Walker<H> {
    handler: Arc<H>,
    statuses: Cache<String, Flow>,
    slots: Arc<Semaphore>,
    concurrency: usize,
    cancel: CancellationToken,
}

// not derived: the handler sits behind an Arc, H itself need not be Clone
impl<H> Clone for Walker<H> {
    fn clone(&self) -> Walker<H> {
        Walker {
            handler: self.handler.clone(),
            statuses: self.statuses.clone(),
            slots: self.slots.clone(),
            concurrency: self.concurrency,
            cancel: self.cancel.clone(),
        }
    }
}

impl<H: Handler + 'static> Walker<H> {
    pub fn new(handler: H, concurrency: usize, cancel: CancellationToken) -> Walker<H> {
        let concurrency = concurrency.max(1);
        Walker {
            handler: Arc::new(handler),
            statuses: Cache::builder().build(),
            slots: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            cancel,
        }
    }

    /// Visit every node reachable from `root` exactly once. Walking several
    /// roots through the same walker shares the statuses map, so overlapping
    /// graphs are not re-visited.
    pub async fn walk(&self, root: Descriptor) -> Result<(), Arc<Error>> {
        self.clone().visit(root, Arc::new(Vec::new())).await?;
        Ok(())
    }

    fn visit(
        self,
        desc: Descriptor,
        path: Arc<Vec<String>>,
    ) -> BoxFuture<'static, Result<Flow, Arc<Error>>> {
        async move {
            if self.cancel.is_cancelled() {
                return Err(Arc::new(Error::Canceled));
            }
            let key = desc.digest().to_string();
            let walker = self.clone();
            let entry = self
                .statuses
                .entry(key)
                .or_try_insert_with(walker.handle(desc, path))
                .await?;
            Ok(entry.into_value())
        }
        .boxed()
    }

    async fn handle(self, desc: Descriptor, path: Arc<Vec<String>>) -> Result<Flow, Error> {
        let pre = {
            let _permit = self.slots.acquire().await.map_err(|_| Error::Canceled)?;
            self.handler.pre(&desc).await?
        };
        let (children, flow) = match pre {
            PreVisit::SkipNode => return Ok(Flow::Done),
            PreVisit::SkipSiblings => (Vec::new(), Flow::SkipSiblings),
            PreVisit::Children(children) => (children, Flow::Done),
        };
        if !children.is_empty() {
            self.walk_children(&desc, children, &path)
                .await
                .map_err(Error::Shared)?;
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        {
            let _permit = self.slots.acquire().await.map_err(|_| Error::Canceled)?;
            self.handler.post(&desc).await?;
        }
        Ok(flow)
    }

    async fn walk_children(
        &self,
        parent: &Descriptor,
        children: Vec<Descriptor>,
        path: &Arc<Vec<String>>,
    ) -> Result<(), Arc<Error>> {
        let child_path = {
            let mut p = Vec::with_capacity(path.len() + 1);
            p.extend(path.iter().cloned());
            p.push(parent.digest().to_string());
            Arc::new(p)
        };

        let mut set: JoinSet<Result<Flow, Arc<Error>>> = JoinSet::new();
        let mut pending = children.into_iter();
        let mut stop_spawning = false;
        let mut first_err: Option<Arc<Error>> = None;
        loop {
            // keep the launch window full, in declaration order
            while !stop_spawning && first_err.is_none() && set.len() < self.concurrency {
                let Some(child) = pending.next() else {
                    break;
                };
                // digests cannot cycle without a hash collision, but a
                // malicious graph should not hang the walk
                if child_path.contains(&child.digest().to_string()) {
                    warn!(
                        "digest {} reappears below itself, skipping",
                        child.digest()
                    );
                    continue;
                }
                set.spawn(self.clone().visit(child, child_path.clone()));
            }
            match set.join_next().await {
                None => break,
                Some(Ok(Ok(Flow::Done))) => {}
                Some(Ok(Ok(Flow::SkipSiblings))) => {
                    stop_spawning = true;
                }
                Some(Ok(Err(e))) => {
                    match &first_err {
                        None => {
                            first_err = Some(e);
                            set.abort_all();
                        }
                        // a real error displaces a recorded cancellation
                        Some(recorded)
                            if matches!(**recorded, Error::Canceled)
                                && !matches!(*e, Error::Canceled) =>
                        {
                            first_err = Some(e);
                        }
                        Some(_) => {}
                    }
                }
                Some(Err(e)) if e.is_cancelled() => {}
                Some(Err(e)) if e.is_panic() => {
                    if first_err.is_none() {
                        first_err = Some(Arc::new(Error::UnexpectedPanic));
                        set.abort_all();
                    }
                }
                Some(Err(e)) => {
                    error!("unknown join error {:?}", e);
                    if first_err.is_none() {
                        first_err = Some(Arc::new(Error::Unknown));
                        set.abort_all();
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
