mod common;

use std::time::Duration;

use bytes::Bytes;
use stripevol::types::ObjectAttr;
use stripevol::{StripeOptions, TargetOp};
use tokio::time::timeout;

use common::{STRIPE, creds, fixture};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connects_share_one_connection() {
    let fx = fixture(4, 0);
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let volume = fx.volume.clone();
        tasks.push(tokio::spawn(async move { volume.connect(&creds()).await }));
    }
    let mut handles = Vec::new();
    for t in tasks {
        handles.push(t.await.unwrap().unwrap());
    }
    assert_eq!(fx.volume.refcount(), 8);
    assert_eq!(fx.calls(TargetOp::Connect), vec![1, 1, 1, 1]);

    for h in handles {
        fx.volume.disconnect(h).await.unwrap();
    }
    assert_eq!(fx.calls(TargetOp::Disconnect), vec![1, 1, 1, 1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_objects_do_not_interfere() {
    let fx = fixture(4, 2);
    for t in &fx.targets {
        t.set_latency(Duration::from_millis(1));
    }
    let _h = fx.connect().await;

    let mut tasks = Vec::new();
    for id in 1..=16u64 {
        let volume = fx.volume.clone();
        tasks.push(tokio::spawn(async move {
            let layout = volume
                .create(&ObjectAttr::with_id(id), &StripeOptions::default())
                .await
                .map_err(|e| e.source)?;
            let data: Bytes = vec![id as u8; 2 * STRIPE as usize + 7].into();
            volume.write(&layout, 0, data.clone()).await?;
            let back = volume.read(&layout, 0, data.len()).await?;
            assert_eq!(back, data);
            volume.destroy(&layout, &ObjectAttr::with_id(id)).await
        }));
    }
    for t in tasks {
        timeout(Duration::from_secs(10), t)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
    assert!(fx.targets.iter().all(|t| t.object_ids().is_empty()));
    assert_eq!(fx.volume.active_target_count(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_liveness_flips_during_statfs() {
    let fx = fixture(4, 0);
    let _h = fx.connect().await;
    let uuid = {
        use stripevol::TargetDevice;
        fx.target(3).uuid()
    };

    let volume = fx.volume.clone();
    let flipper = tokio::spawn(async move {
        for i in 0..50 {
            volume.notify(uuid, i % 2 == 1).await.unwrap();
        }
    });
    for _ in 0..50 {
        let st = fx.volume.statfs().await.unwrap();
        assert!(st.blocks > 0);
    }
    flipper.await.unwrap();
    assert_eq!(fx.volume.active_target_count(), 4);
}
