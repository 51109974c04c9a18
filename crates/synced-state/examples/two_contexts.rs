//! 两个上下文共享同一个 sled 数据库上的计数器
//!
//! 运行: cargo run -p synced-state --example two_contexts

use std::sync::Arc;
use std::time::Duration;

use synced_state::{KeyValueStore, SledBroadcast, SledStore, SyncEnvironment, SyncEvent, SyncedState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let temp_dir = tempfile::tempdir()?;
    let store = SledStore::open(temp_dir.path()).await?;
    let shared: Arc<dyn KeyValueStore> = Arc::new(store.clone());
    let poll = Duration::from_millis(50);

    let tab_a = SyncEnvironment::builder()
        .store(shared.clone())
        .transport(Arc::new(SledBroadcast::new(store.db(), "demo", poll)?))
        .build();
    let tab_b = SyncEnvironment::builder()
        .store(shared)
        .transport(Arc::new(SledBroadcast::new(store.db(), "demo", poll)?))
        .build();

    tab_b.events().add_listener("loaded", |event| {
        if let SyncEvent::Loaded { key, found, .. } = event {
            println!("[tab b] 已加载 {} (存储中已有值: {})", key, found);
        }
    });

    let counter_a = SyncedState::builder("counter").initial(0u32).spawn(&tab_a);
    counter_a.wait_until_loaded().await?;
    let counter_b = SyncedState::builder("counter").initial(0u32).spawn(&tab_b);
    counter_b.wait_until_loaded().await?;

    let mut watch_b = counter_b.subscribe();
    for _ in 0..3 {
        counter_a.update(|prev| prev.map(|n| n + 1));
        counter_a.flush().await?;

        let expected = counter_a.get();
        tokio::time::timeout(Duration::from_secs(2), watch_b.wait_for(|s| !s.loading && s.value == expected)).await??;
        println!("[tab a] {:?}  [tab b] {:?}", counter_a.get(), counter_b.get());
    }

    counter_b.clear();
    counter_b.flush().await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("清除后 [tab a] {:?}", counter_a.get());

    Ok(())
}
