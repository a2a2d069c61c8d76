mod common;

use common::{discrete, rig};
use vk_dispatch::{copy, copy_async, copy_range, kind, Buffer, Error, SimConfig};

#[test]
fn copy_range_places_elements() {
    let rig = discrete();
    let src = Buffer::<u32>::from_fn(&rig.device, 10, |i| i as u32).unwrap();
    let dst = Buffer::<u32, kind::Host>::with_value(&rig.device, 10, 0).unwrap();

    copy_range(&src, 2..5, &dst, 6).unwrap();
    assert_eq!(dst.to_vec().unwrap(), vec![0, 0, 0, 0, 0, 0, 2, 3, 4, 0]);
}

#[test]
fn copy_checks_bounds() {
    let rig = discrete();
    let src = Buffer::<u8>::new(&rig.device, 8).unwrap();
    let dst = Buffer::<u8>::new(&rig.device, 4).unwrap();

    assert!(matches!(copy(&src, &dst), Err(Error::Precondition(_))));
    assert!(matches!(
        copy_range(&src, 4..9, &dst, 0),
        Err(Error::Precondition(_))
    ));
    assert!(matches!(
        copy_range(&src, 0..2, &dst, 3),
        Err(Error::Precondition(_))
    ));
    copy_range(&src, 4..8, &dst, 0).unwrap();
}

#[test]
fn copy_between_devices_is_rejected() {
    let a = discrete();
    let b = discrete();
    let src = Buffer::<u8>::new(&a.device, 4).unwrap();
    let dst = Buffer::<u8>::new(&b.device, 4).unwrap();
    assert!(matches!(copy(&src, &dst), Err(Error::Precondition(_))));
}

#[test]
fn partitioned_async_copies_fill_destination() {
    let rig = rig(SimConfig::default().dedicated_transfer(true));
    assert!(rig.device.queue_families().has_dedicated_transfer());

    let n = 1000;
    let src = Buffer::<f32>::from_fn(&rig.device, n, |i| i as f32).unwrap();
    let dst = Buffer::<f32, kind::HostCached>::new(&rig.device, n).unwrap();

    let chunk = 256;
    let mut pending: Vec<_> = (0..n)
        .step_by(chunk)
        .map(|start| {
            let end = (start + chunk).min(n);
            copy_async(&src, start..end, &dst, start).unwrap()
        })
        .collect();
    assert_eq!(pending.len(), 4);

    for handle in &mut pending {
        assert!(handle.wait(u64::MAX));
        assert!(!handle.is_pending());
    }
    let expected: Vec<f32> = (0..n).map(|i| i as f32).collect();
    assert_eq!(dst.to_vec().unwrap(), expected);
}

#[test]
fn two_halves_match_a_whole_copy() {
    let rig = discrete();
    let src = Buffer::<u32>::from_fn(&rig.device, 301, |i| (i * 7) as u32).unwrap();
    let whole = Buffer::<u32>::new(&rig.device, 301).unwrap();
    let halves = Buffer::<u32>::new(&rig.device, 301).unwrap();

    copy(&src, &whole).unwrap();
    let mut first = copy_async(&src, 0..150, &halves, 0).unwrap();
    let mut second = copy_async(&src, 150..301, &halves, 150).unwrap();
    first.wait_forever();
    second.wait_forever();

    assert_eq!(halves.to_vec().unwrap(), whole.to_vec().unwrap());
}

#[test]
fn empty_async_copy_completes_immediately() {
    let rig = discrete();
    let src = Buffer::<u32>::new(&rig.device, 4).unwrap();
    let dst = Buffer::<u32>::new(&rig.device, 4).unwrap();

    let mut handle = copy_async(&src, 2..2, &dst, 0).unwrap();
    assert!(handle.wait(0));
    assert_eq!(rig.sim.stats().copies, 0);
}

#[test]
fn async_copy_keeps_buffers_alive() {
    let rig = discrete();
    let src = Buffer::<u64, kind::Host>::from_slice(&rig.device, &[1, 2, 3]).unwrap();
    let dst = Buffer::<u64>::new(&rig.device, 3).unwrap();
    let live_with_buffers = rig.sim.live_objects();

    let handle = copy_async(&src, 0..3, &dst, 0).unwrap();
    drop(src);
    drop(dst);
    // Both buffers and their memory are still referenced by the copy
    assert!(rig.sim.live_objects() >= live_with_buffers);

    drop(handle);
    assert_eq!(rig.sim.live_objects(), 1);
}
