mod common;

use ash::vk;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::discrete;
use vk_dispatch::{Delayed, QueueKind};

fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let bump = count.clone();
    (count, move || {
        bump.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn action_runs_once_on_wait_then_drop() {
    let rig = discrete();
    let (count, action) = counter();

    let mut handle = Delayed::signaled(rig.device.clone(), action).unwrap();
    assert!(handle.is_pending());
    assert_eq!(count.load(Ordering::SeqCst), 0);

    assert!(handle.wait(0));
    assert!(handle.wait(u64::MAX));
    assert_eq!(count.load(Ordering::SeqCst), 1);
    drop(handle);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn action_runs_once_on_drop_alone() {
    let rig = discrete();
    let (count, action) = counter();

    let handle = Delayed::signaled(rig.device.clone(), action).unwrap();
    drop(handle);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(rig.sim.live_objects(), 1, "fence destroyed with the handle");
}

#[test]
fn unsignaled_fence_times_out_without_running_action() {
    let rig = discrete();
    let (count, action) = counter();
    let fence = rig.device.driver().create_fence(false).unwrap();
    let event = rig.device.driver().create_event().unwrap();

    let mut handle = Delayed::with_event(rig.device.clone(), fence, event, action);
    assert!(!handle.wait(0));
    assert!(!handle.wait(1_000));
    assert!(handle.is_pending());
    assert_eq!(count.load(Ordering::SeqCst), 0);

    assert!(handle.resume());

    // An empty submission signals the fence
    let cmd = rig.device.begin_commands(QueueKind::Compute).unwrap();
    rig.device.end_commands(QueueKind::Compute, cmd).unwrap();
    rig.device.submit(QueueKind::Compute, cmd, fence).unwrap();

    assert!(handle.wait(0));
    assert_eq!(count.load(Ordering::SeqCst), 1);
    rig.device.free_commands(QueueKind::Compute, cmd);
    drop(handle);
    assert_eq!(rig.sim.live_objects(), 1);
}

#[test]
fn failed_handle_is_inert() {
    let mut handle = Delayed::failed(vk::Result::ERROR_DEVICE_LOST);
    assert_eq!(handle.status(), vk::Result::ERROR_DEVICE_LOST);
    assert!(!handle.is_pending());
    assert!(!handle.resume());
    assert!(handle.wait(0));
}

#[test]
fn handles_complete_from_other_threads() {
    let rig = discrete();
    let (count, action) = counter();
    let handle = Delayed::signaled(rig.device.clone(), action).unwrap();

    std::thread::spawn(move || drop(handle)).join().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}
