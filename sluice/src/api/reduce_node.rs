//! Reduction by key across all workers.

use std::hash::Hash;
use std::thread::JoinHandle;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::context::Context;
use crate::api::stage::Stage;
use crate::core::{ReduceByHash, ReducePostPhase, ReducePrePhase, TableContext};
use crate::data::{MixReader, MixStream};
use crate::logging::{SluiceEvent, SluiceLogger};
use crate::{Error, Result};

/// Salt of the pre phase's index function, which decides the worker of each key.
const PRE_PHASE_SALT: u64 = 0;
/// Salt of the post phase's index function, unrelated to the pre phase's so that keys
/// arriving at one worker spread over all of its partitions.
const POST_PHASE_SALT: u64 = 0x5EED;

type PostPhase<K, V, R> = ReducePostPhase<K, V, R, ReduceByHash>;

/// Where the post phase is while the node runs.
enum Post<K, V, R> {
    /// Not started yet.
    Idle,
    /// Filled on this thread in `execute`.
    Local(PostPhase<K, V, R>, MixReader),
    /// Filled by an auxiliary thread during the pre phase.
    Thread(JoinHandle<Result<PostPhase<K, V, R>>>),
    /// Filled and ready to push.
    Done(PostPhase<K, V, R>),
}

/// Reduces pairs by key: locally before the exchange, then on the worker each key hashes to.
pub struct ReduceNode<K, V, R> {
    table_context: TableContext,
    stream: MixStream,
    block_size: usize,
    limit_memory_bytes: usize,
    use_post_thread: bool,
    reduce: R,
    pre: Option<ReducePrePhase<K, V, R>>,
    post: Post<K, V, R>,
    logger: Option<SluiceLogger>,
}

impl<K, V, R> ReduceNode<K, V, R>
where
    K: Eq + Hash + Default + Serialize + DeserializeOwned + Send + 'static,
    V: Serialize + DeserializeOwned + Send + 'static,
    R: Fn(&V, &V) -> V + Clone + Send + 'static,
{
    /// A node of `context`'s worker; all workers must create it at the same point.
    pub fn new(context: &mut Context, reduce: R) -> Result<Self> {
        let dia_id = context.next_dia_id();
        let stream = context.new_mix_stream()?;
        let config = context.reduce_config().clone();
        // the pre and post tables are alive at the same time
        let limit_memory_bytes = config.limit_memory_bytes.unwrap_or(context.mem_limit() / 2);
        Ok(ReduceNode {
            table_context: context.table_context(dia_id),
            stream,
            block_size: context.block_size(),
            limit_memory_bytes,
            use_post_thread: config.use_post_thread,
            reduce,
            pre: None,
            post: Post::Idle,
            logger: context.logger(),
        })
    }

    fn log(&self, text: String) {
        if let Some(logger) = &self.logger {
            logger.log(SluiceEvent::Text(text));
        }
    }
}

/// Inserts everything `reader` yields into `post`.
fn drain<K, V, R>(post: &mut PostPhase<K, V, R>, reader: &mut MixReader) -> Result<()>
where
    K: Eq + Hash + Default + Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
    R: Fn(&V, &V) -> V + Clone,
{
    while reader.has_next()? {
        post.insert(reader.next()?)?;
    }
    Ok(())
}

impl<K, V, R> Stage for ReduceNode<K, V, R>
where
    K: Eq + Hash + Default + Serialize + DeserializeOwned + Send + 'static,
    V: Serialize + DeserializeOwned + Send + 'static,
    R: Fn(&V, &V) -> V + Clone + Send + 'static,
{
    type Input = (K, V);
    type Output = (K, V);

    fn start_pre_op(&mut self) -> Result<()> {
        let writers = self.stream.get_writers(self.block_size);
        self.pre = Some(ReducePrePhase::new(
            self.table_context.clone(),
            writers,
            self.limit_memory_bytes,
            ReduceByHash::new(PRE_PHASE_SALT),
            self.reduce.clone(),
        ));

        let post = ReducePostPhase::new(
            self.table_context.clone(),
            self.limit_memory_bytes,
            ReduceByHash::new(POST_PHASE_SALT),
            self.reduce.clone(),
        );
        let mut reader = self.stream.get_reader()?;
        self.post = if self.use_post_thread {
            let thread = std::thread::Builder::new()
                .name(format!("sluice:reduce-post {}", self.table_context.dia_id))
                .spawn(move || {
                    let mut post = post;
                    drain(&mut post, &mut reader)?;
                    Ok(post)
                })?;
            Post::Thread(thread)
        }
        else {
            Post::Local(post, reader)
        };
        Ok(())
    }

    fn pre_op(&mut self, item: (K, V)) -> Result<()> {
        match &mut self.pre {
            Some(pre) => pre.insert(item).map(|_| ()),
            None => Err(Error::Format("reduce input before start_pre_op".to_owned())),
        }
    }

    fn stop_pre_op(&mut self) -> Result<()> {
        if let Some(mut pre) = self.pre.take() {
            pre.flush_and_close()?;
            self.log(format!("reduce {} sent {} items", self.table_context.dia_id, pre.emitted()));
        }
        Ok(())
    }

    fn execute(&mut self) -> Result<()> {
        self.post = match std::mem::replace(&mut self.post, Post::Idle) {
            Post::Local(mut post, mut reader) => {
                drain(&mut post, &mut reader)?;
                Post::Done(post)
            },
            Post::Thread(thread) => {
                let post = thread
                    .join()
                    .map_err(|_| Error::Thread(format!("reduce {} post phase thread panicked", self.table_context.dia_id)))??;
                Post::Done(post)
            },
            other => other,
        };
        Ok(())
    }

    fn push_data(&mut self, consume: bool, emit: &mut dyn FnMut(&(K, V)) -> Result<()>) -> Result<()> {
        match &mut self.post {
            Post::Done(post) => post.push_data(consume, emit),
            _ => Err(Error::Format("reduce output pushed before execute".to_owned())),
        }
    }

    fn dispose(&mut self) {
        if let Some(mut pre) = self.pre.take() {
            pre.dispose();
        }
        if let Post::Done(post) = &mut self.post {
            post.dispose();
        }
    }
}
