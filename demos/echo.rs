use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use http::{Method, Request, StatusCode, Version};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use micro_channel::channel::input::ChunkQueue;
use micro_channel::config::{Connector, HttpConfig};
use micro_channel::error::ChannelError;
use micro_channel::exchange::{Chunk, RequestMeta, ResponseMeta};
use micro_channel::handler::make_server;
use micro_channel::scheduling::{TokioExecutor, TokioScheduler};
use micro_channel::transport::{Endpoint, SendCallback, Transport};
use micro_channel::Channel;

/// Transport that prints response frames instead of writing to a socket.
struct ConsoleTransport;

impl Transport for ConsoleTransport {
    fn send(
        &self,
        _request: Option<&RequestMeta>,
        response: Option<ResponseMeta>,
        content: Option<Bytes>,
        last: bool,
        callback: SendCallback,
    ) {
        if let Some(meta) = &response {
            info!(status = %meta.status(), content_length = ?meta.content_length(), "commit");
        }
        if let Some(content) = &content {
            info!(body = %String::from_utf8_lossy(content), last, "content");
        }
        callback(Ok(()));
    }

    fn abort(&self, failure: &Arc<ChannelError>) {
        info!(cause = %failure, "aborted");
    }

    fn on_completed(&self) {
        info!("exchange completed");
    }
}

struct ConsoleEndpoint;

impl Endpoint for ConsoleEndpoint {
    fn idle_timeout(&self) -> Option<Duration> {
        None
    }

    fn set_idle_timeout(&self, _timeout: Option<Duration>) {}

    fn is_open(&self) -> bool {
        true
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let server = make_server(|channel: &Channel| {
        let mut body = Vec::new();
        while let Some(chunk) = channel.produce_content() {
            match chunk {
                Chunk::Data(bytes) => body.extend_from_slice(&bytes),
                Chunk::Eof => break,
                Chunk::Error(failure) => return Err(ChannelError::application(failure)),
            }
        }
        info!(len = body.len(), "request body consumed");

        let reply = if body.is_empty() { b"Hello World!".to_vec() } else { body };
        channel.response().set_status(StatusCode::OK);
        channel.response().set_content_length(reply.len() as u64);
        channel.buffer_content(&reply);
        channel.request().set_handled(true);
        Ok(())
    });

    let connector = Connector::new(
        HttpConfig::default(),
        Arc::new(TokioExecutor::current()),
        Arc::new(TokioScheduler::current()),
        Arc::new(server),
    );

    let queue = Arc::new(ChunkQueue::new());
    let channel = Channel::new(
        Arc::new(connector),
        Arc::new(ConsoleEndpoint),
        Arc::new(ConsoleTransport),
        queue.clone(),
    );

    // One scripted POST, as if a parser had just delivered it.
    let meta: RequestMeta = Request::builder()
        .method(Method::POST)
        .uri("/echo")
        .version(Version::HTTP_11)
        .header(http::header::HOST, "localhost")
        .header(http::header::CONTENT_LENGTH, 4)
        .body(())?
        .into();

    queue.push(Bytes::from_static(b"ping"));
    channel.on_request(meta);
    channel.on_content(&Bytes::from_static(b"ping"));
    channel.on_request_complete();
    channel.handle();

    Ok(())
}
