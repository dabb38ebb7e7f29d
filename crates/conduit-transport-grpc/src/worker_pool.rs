//! Handler-invocation off-loading for Binary-RPC (§4.7.1's multiprocess
//! option), implemented as a bounded pool of dedicated OS threads rather
//! than literal subprocesses -- see DESIGN.md for why. `max_workers == 1`
//! skips this module entirely and runs on the calling async task (see
//! `GrpcTransport::new`).

use std::sync::Arc;

use conduit_core::dispatch::{Outcome, RequestBytes};
use conduit_core::{CancelToken, Codec, Endpoint, Metadata};
use tokio::sync::{mpsc, oneshot};

struct Job {
    endpoint: Endpoint,
    codec: Arc<dyn Codec>,
    request: RequestBytes,
    metadata: Metadata,
    reply: oneshot::Sender<Outcome>,
}

pub struct WorkerPool {
    sender: mpsc::Sender<Job>,
}

impl WorkerPool {
    /// `workers == 0` asks for one thread per available CPU.
    pub fn new(workers: u32) -> Self {
        let worker_count = if workers == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            workers as usize
        };

        let (sender, receiver) = mpsc::channel::<Job>(worker_count * 4);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        for index in 0..worker_count {
            let receiver = receiver.clone();
            std::thread::Builder::new()
                .name(format!("conduit-grpc-worker-{index}"))
                .spawn(move || worker_main(receiver))
                .expect("failed to spawn conduit-grpc worker thread");
        }

        WorkerPool { sender }
    }

    pub async fn dispatch(
        &self,
        endpoint: Endpoint,
        codec: Arc<dyn Codec>,
        request: RequestBytes,
        metadata: Metadata,
    ) -> Outcome {
        let (reply, receive) = oneshot::channel();
        let job = Job { endpoint, codec, request, metadata, reply };
        if self.sender.send(job).await.is_err() {
            tracing::error!("grpc worker pool channel closed, dispatching in-process instead");
            return Outcome::Unary(Err(conduit_core::RpcError::uncaught()));
        }
        receive.await.unwrap_or_else(|_| Outcome::Unary(Err(conduit_core::RpcError::uncaught())))
    }
}

fn worker_main(receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build conduit-grpc worker runtime");

    runtime.block_on(async move {
        loop {
            let job = {
                let mut receiver = receiver.lock().await;
                receiver.recv().await
            };
            let Some(job) = job else { break };
            let outcome = conduit_core::dispatch::run(
                Arc::new(job.endpoint),
                job.codec,
                job.request,
                job.metadata,
                CancelToken::new(),
            )
            .await;
            let _ = job.reply.send(outcome);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use conduit_core::model::{Cardinality, FieldSchema, LogicalType, Schema, Value};
    use conduit_core::{BoxFuture, Handler, HandlerArgs, ReplyOutput, RequestInput, RpcError};

    struct EchoCodec;
    impl Codec for EchoCodec {
        fn decode(&self, bytes: &[u8], _schema: &Schema) -> Result<Value, RpcError> {
            Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
        }
        fn encode(&self, value: &Value, _schema: &Schema) -> Bytes {
            match value {
                Value::String(s) => Bytes::from(s.clone().into_bytes()),
                _ => Bytes::new(),
            }
        }
        fn encode_error(&self, err: &RpcError) -> Bytes {
            Bytes::from(format!("error:{}", err.kind_name()))
        }
        fn name(&self) -> &'static str {
            "echo-test"
        }
    }

    struct EchoHandler;
    impl Handler for EchoHandler {
        fn call(&self, args: HandlerArgs) -> BoxFuture<'static, Result<ReplyOutput, RpcError>> {
            Box::pin(async move {
                match args.request {
                    RequestInput::Unary(value) => Ok(ReplyOutput::Unary(value)),
                    RequestInput::Stream(_) => Err(RpcError::Internal),
                }
            })
        }
    }

    fn echo_endpoint() -> Endpoint {
        let schema = Schema::new("test.Echo", vec![FieldSchema { name: "value".into(), ty: LogicalType::String }]);
        Endpoint::new(
            conduit_core::Path::from("/test.Echo/Call"),
            Cardinality::UnaryUnary,
            schema.clone(),
            schema,
            Arc::new(EchoHandler),
        )
    }

    #[tokio_test_lite::test]
    async fn dispatches_job_through_a_worker_thread() {
        let pool = WorkerPool::new(2);
        let outcome = pool
            .dispatch(echo_endpoint(), Arc::new(EchoCodec), RequestBytes::Unary(Bytes::from_static(b"hi")), Metadata::new())
            .await;
        match outcome {
            Outcome::Unary(Ok(Value::String(s))) => assert_eq!(s, "hi"),
            Outcome::Unary(Ok(_)) => panic!("unexpected reply value"),
            Outcome::Unary(Err(err)) => panic!("unexpected error: {err}"),
            Outcome::Streaming(_) => panic!("unexpected streaming outcome"),
        }
    }
}
