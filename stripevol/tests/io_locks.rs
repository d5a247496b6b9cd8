mod common;

use bytes::Bytes;
use stripevol::types::{CancelFlags, Extent, LockMode, LockPolicy, ObjectAttr};
use stripevol::{CallSet, StripeOptions, TargetDevice, TargetOp, VolumeError};

use common::{STRIPE, fixture};

fn pattern(len: usize) -> Bytes {
    (0..len).map(|i| (i % 253) as u8).collect::<Vec<_>>().into()
}

#[tokio::test]
async fn test_write_read_across_stripes() {
    let fx = fixture(3, 0);
    let _h = fx.connect().await;
    let layout = fx
        .volume
        .create(&ObjectAttr::with_id(7), &StripeOptions::default())
        .await
        .unwrap();

    let data = pattern(5 * STRIPE as usize + 123);
    fx.volume.write(&layout, 1000, data.clone()).await.unwrap();
    assert_eq!(fx.calls(TargetOp::Write), vec![1, 1, 1]);

    let back = fx.volume.read(&layout, 1000, data.len()).await.unwrap();
    assert_eq!(back, data);

    let head = fx.volume.read(&layout, 0, 1000).await.unwrap();
    assert!(head.iter().all(|b| *b == 0));
    let tail = fx
        .volume
        .read(&layout, 1000 + data.len() as u64, 500)
        .await
        .unwrap();
    assert_eq!(tail.len(), 500);
    assert!(tail.iter().all(|b| *b == 0));

    // first stripe unit lands on target 0 at its local offset
    let sub = fx.target(0).object_data(7).unwrap();
    assert_eq!(&sub[1000..1010], &data[..10]);
}

#[tokio::test]
async fn test_io_on_inactive_stripe_is_unavailable() {
    let fx = fixture(3, 0);
    let _h = fx.connect().await;
    let layout = fx
        .volume
        .create(&ObjectAttr::with_id(8), &StripeOptions::default())
        .await
        .unwrap();
    fx.volume.notify(fx.target(1).uuid(), false).await.unwrap();

    assert_eq!(
        fx.volume.check_io(&layout, 0, 2 * STRIPE as usize),
        Err(VolumeError::Unavailable)
    );
    fx.volume.check_io(&layout, 0, 100).unwrap();

    assert_eq!(
        fx.volume
            .write(&layout, 0, pattern(2 * STRIPE as usize))
            .await,
        Err(VolumeError::Unavailable)
    );
    assert_eq!(fx.target(1).calls(TargetOp::Write), 0);
    fx.volume.write(&layout, 0, pattern(100)).await.unwrap();
    assert_eq!(
        fx.volume.read(&layout, STRIPE, 10).await,
        Err(VolumeError::Unavailable)
    );
}

#[tokio::test]
async fn test_async_getattr_and_read_share_call_set() {
    let fx = fixture(3, 0);
    let _h = fx.connect().await;
    let layout = fx
        .volume
        .create(&ObjectAttr::with_id(0x50), &StripeOptions::default())
        .await
        .unwrap();
    let data = pattern(3 * STRIPE as usize + 100);
    fx.volume.write(&layout, 0, data.clone()).await.unwrap();

    let mut set = CallSet::new();
    let attr_reply = fx.volume.getattr_async(&layout, &mut set).unwrap();
    let read_reply = fx
        .volume
        .read_async(&layout, 0, data.len(), &mut set)
        .unwrap();
    assert_eq!(set.len(), 6);
    // nothing runs before the set is waited on
    assert_eq!(fx.calls(TargetOp::Getattr), vec![0, 0, 0]);

    set.wait().await.unwrap();
    let attr = attr_reply.wait().await.unwrap();
    assert_eq!(attr.id, 0x50);
    assert_eq!(attr.size, data.len() as u64);
    assert_eq!(read_reply.wait().await.unwrap(), data);
}

#[tokio::test]
async fn test_async_write_then_sync_read() {
    let fx = fixture(2, 0);
    let _h = fx.connect().await;
    let layout = fx
        .volume
        .create(&ObjectAttr::with_id(0x51), &StripeOptions::default())
        .await
        .unwrap();
    let data = pattern(STRIPE as usize + 17);
    let mut set = CallSet::new();
    let reply = fx
        .volume
        .write_async(&layout, 5, data.clone(), &mut set)
        .unwrap();
    set.wait().await.unwrap();
    reply.wait().await.unwrap();
    assert_eq!(fx.volume.read(&layout, 5, data.len()).await.unwrap(), data);
}

#[tokio::test]
async fn test_async_batch_not_queued_when_stripe_inactive() {
    let fx = fixture(3, 0);
    let _h = fx.connect().await;
    let layout = fx
        .volume
        .create(&ObjectAttr::with_id(0x52), &StripeOptions::default())
        .await
        .unwrap();
    fx.volume.notify(fx.target(2).uuid(), false).await.unwrap();

    let mut set = CallSet::new();
    let res = fx
        .volume
        .read_async(&layout, 0, 3 * STRIPE as usize, &mut set);
    assert!(matches!(res, Err(VolumeError::Unavailable)));
    assert!(set.is_empty());
}

#[tokio::test]
async fn test_async_failure_reaches_reply_and_set() {
    let fx = fixture(3, 0);
    let _h = fx.connect().await;
    let layout = fx
        .volume
        .create(&ObjectAttr::with_id(0x53), &StripeOptions::default())
        .await
        .unwrap();
    fx.target(1)
        .fail(TargetOp::Getattr, VolumeError::Io("eio".into()));

    let mut set = CallSet::new();
    let reply = fx.volume.getattr_async(&layout, &mut set).unwrap();
    assert_eq!(set.wait().await, Err(VolumeError::Io("eio".into())));
    assert_eq!(reply.wait().await, Err(VolumeError::Io("eio".into())));
    assert_eq!(
        layout.test_and_clear_async_rc(),
        Err(VolumeError::Io("eio".into()))
    );
}

#[tokio::test]
async fn test_enqueue_match_cancel() {
    let fx = fixture(3, 0);
    let _h = fx.connect().await;
    let layout = fx
        .volume
        .create(&ObjectAttr::with_id(0x60), &StripeOptions::default())
        .await
        .unwrap();

    let lockh = fx
        .volume
        .enqueue(&layout, LockPolicy::new(LockMode::Write, Extent::whole()))
        .await
        .unwrap();
    assert_eq!(lockh.held().count(), 3);
    assert!(fx.targets.iter().all(|t| t.lock_count() == 1));

    let matched = fx
        .volume
        .lock_match(&layout, LockPolicy::new(LockMode::Read, Extent::new(0, 100)))
        .await
        .unwrap()
        .expect("write lock covers the read");
    assert!(matched.get(0).is_some());
    assert!(matched.get(1).is_none());
    assert_eq!(fx.target(0).lock_count(), 2);

    fx.volume.cancel(&layout, &matched).await.unwrap();
    assert_eq!(fx.target(0).lock_count(), 1);
    fx.volume.cancel(&layout, &lockh).await.unwrap();
    assert!(fx.targets.iter().all(|t| t.lock_count() == 0));
}

#[tokio::test]
async fn test_enqueue_failure_releases_granted_locks() {
    let fx = fixture(3, 0);
    let _h = fx.connect().await;
    let layout = fx
        .volume
        .create(&ObjectAttr::with_id(0x61), &StripeOptions::default())
        .await
        .unwrap();
    fx.target(1)
        .fail(TargetOp::Enqueue, VolumeError::Io("busy".into()));

    let res = fx
        .volume
        .enqueue(&layout, LockPolicy::new(LockMode::Write, Extent::whole()))
        .await;
    assert_eq!(res, Err(VolumeError::Io("busy".into())));
    assert_eq!(fx.calls(TargetOp::Enqueue), vec![1, 1, 0]);
    assert_eq!(fx.calls(TargetOp::Cancel), vec![1, 0, 0]);
    assert!(fx.targets.iter().all(|t| t.lock_count() == 0));
}

#[tokio::test]
async fn test_match_needs_every_stripe() {
    let fx = fixture(3, 0);
    let _h = fx.connect().await;
    let layout = fx
        .volume
        .create(&ObjectAttr::with_id(0x62), &StripeOptions::default())
        .await
        .unwrap();
    fx.volume
        .enqueue(&layout, LockPolicy::new(LockMode::Write, Extent::new(0, STRIPE)))
        .await
        .unwrap();

    let res = fx
        .volume
        .lock_match(
            &layout,
            LockPolicy::new(LockMode::Read, Extent::new(0, STRIPE + 10)),
        )
        .await
        .unwrap();
    assert!(res.is_none());
    assert_eq!(fx.calls(TargetOp::Match), vec![1, 1, 0]);
    // the reference taken on stripe 0 was dropped again
    assert_eq!(fx.target(0).lock_count(), 1);
    assert_eq!(fx.calls(TargetOp::Cancel), vec![1, 0, 0]);
}

#[tokio::test]
async fn test_cancel_unused_degrades_gracefully() {
    let fx = fixture(3, 0);
    let _h = fx.connect().await;
    let layout = fx
        .volume
        .create(&ObjectAttr::with_id(0x63), &StripeOptions::default())
        .await
        .unwrap();
    fx.volume
        .enqueue(&layout, LockPolicy::new(LockMode::Read, Extent::whole()))
        .await
        .unwrap();

    fx.target(0)
        .fail(TargetOp::CancelUnused, VolumeError::Io("x".into()));
    fx.volume
        .cancel_unused(Some(&layout), CancelFlags::empty())
        .await
        .unwrap();
    assert_eq!(fx.target(0).lock_count(), 1);
    assert_eq!(fx.target(1).lock_count(), 0);

    fx.target(0).clear_faults();
    fx.volume
        .cancel_unused(None, CancelFlags::LOCAL_ONLY)
        .await
        .unwrap();
    assert!(fx.targets.iter().all(|t| t.lock_count() == 0));

    for t in &fx.targets {
        t.fail(TargetOp::CancelUnused, VolumeError::Io("down".into()));
    }
    assert_eq!(
        fx.volume.cancel_unused(None, CancelFlags::empty()).await,
        Err(VolumeError::Io("down".into()))
    );
}
