//! A minimal handler: reads (and discards) the request body, then replies
//! `200 OK` with a fixed body. Run with `cargo run --example hello`.

use bytes::Bytes;
use rasgi::handler::{handler_fn, ReceiveEvent, SendEvent};
use rasgi::{Config, Server};

async fn hello(
    _scope: rasgi::Scope,
    mut receive: Box<dyn rasgi::handler::Receive + '_>,
    mut send: Box<dyn rasgi::handler::Send_ + '_>,
) -> Result<(), rasgi::error::BoxError> {
    loop {
        match receive.receive().await? {
            ReceiveEvent::Request { more_body, .. } if more_body => continue,
            _ => break,
        }
    }

    send.send(SendEvent::ResponseStart {
        status: 200,
        headers: vec![(
            Bytes::from_static(b"content-length"),
            Bytes::from_static(b"13"),
        )],
    })
    .await?;
    send.send(SendEvent::ResponseBody {
        body: Bytes::from_static(b"Hello, world!"),
        more_body: false,
    })
    .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt::init();

    let config = Config::new(handler_fn(|scope, receive, send| Box::pin(hello(scope, receive, send))))
        .host([127, 0, 0, 1].into())
        .port(8000);

    let server = Server::new(config)?;
    println!("listening on http://{}", server.local_addr());
    server.serve().await?;
    Ok(())
}
