//! Ping - connect, inspect the server and run a few requests.
//!
//! This example demonstrates:
//! - Building a connection with the fluent builder
//! - Reading the server version and schema id
//! - Ping, call and select with field access by name
//!
//! # Running against a local server
//!
//! ```lua
//! box.cfg{listen = 3301}
//! box.schema.space.create('tester', {if_not_exists = true, format = {
//!     {name = 'id', type = 'unsigned'},
//!     {name = 'name', type = 'string'},
//! }})
//! box.space.tester:create_index('primary', {if_not_exists = true})
//! box.schema.user.grant('guest', 'read,write,execute', 'universe', nil, {if_not_exists = true})
//! ```
//!
//! ```sh
//! RUST_LOG=iproto_client=debug cargo run --example ping
//! ```

use std::time::{Duration, Instant};

use iproto_client::{Connection, SelectOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let port = std::env::var("IPROTO_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3301);

    let conn = Connection::builder()
        .host("127.0.0.1")
        .port(port)
        .request_timeout(Duration::from_secs(2))
        .connect()
        .await?;

    println!(
        "Connected to {} (schema {:?})",
        conn.server_version().unwrap_or_default(),
        conn.schema_id()
    );

    let started = Instant::now();
    for _ in 0..1000 {
        conn.ping().await?;
    }
    println!("1000 pings in {:?}", started.elapsed());

    let reply = conn.call("box.info.version", ()).await?;
    println!("box.info.version() = {:?}", reply.data);

    conn.replace("tester", (1u32, "hello")).await?;
    let reply = conn.select("tester", (), SelectOptions::new().limit(10)).await?;
    for row in reply.rows() {
        println!("{:?}", row.named_fields());
    }

    conn.close();
    Ok(())
}
