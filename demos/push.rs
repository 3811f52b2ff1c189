//! Push - receive session pushes and watcher events.
//!
//! This example demonstrates:
//! - Subscribing to server-initiated notifications
//! - Watching a key with `box.broadcast`
//! - Pushes produced by `box.session.push` during a call
//!
//! # Running against a local server
//!
//! ```lua
//! box.cfg{listen = 3301}
//! function produce(n)
//!     for i = 1, n do box.session.push(i) end
//!     return 'done'
//! end
//! box.schema.user.grant('guest', 'execute', 'universe', nil, {if_not_exists = true})
//! ```
//!
//! ```sh
//! cargo run --example push
//! ```

use std::time::Duration;

use iproto_client::Connection;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let conn = Connection::builder().port(3301).connect().await?;
    let mut notifications = conn.subscribe();

    conn.watch("demo.status").await?;
    let reply = conn.call("produce", (3,)).await?;
    println!("produce(3) = {:?}", reply.data);

    conn.eval("box.broadcast('demo.status', ...)", ("ready",))
        .await?;

    // Initial event, three pushes, then the broadcast.
    for _ in 0..5 {
        match tokio::time::timeout(Duration::from_secs(1), notifications.next()).await {
            Ok(Some(note)) => match &note.key {
                Some(key) => println!("event {} = {:?}", key, note.data),
                None => println!("push (sync {}) = {:?}", note.sync, note.data),
            },
            Ok(None) => break,
            Err(_) => {
                println!("no more notifications");
                break;
            }
        }
    }

    conn.unwatch("demo.status").await?;
    conn.close();
    Ok(())
}
