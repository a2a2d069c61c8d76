mod common;

use proptest::prelude::*;
use std::sync::Arc;

use common::{discrete, rig};
use vk_dispatch::memory::HostExchange;
use vk_dispatch::{copy, kind, Buffer, Device, Error, SimConfig};

fn round_trip<M: HostExchange>(device: &Arc<Device>, data: &[i32]) -> Vec<i32> {
    let buffer = Buffer::<i32, M>::from_slice(device, data).unwrap();
    assert_eq!(buffer.len(), data.len());
    buffer.to_vec().unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn host_exchange_round_trips_on_every_kind(
        data in prop::collection::vec(any::<i32>(), 0..300),
        integrated in any::<bool>(),
    ) {
        let config = if integrated { SimConfig::integrated() } else { SimConfig::default() };
        let rig = rig(config);
        let device = &rig.device;

        prop_assert_eq!(round_trip::<kind::Host>(device, &data), data.clone());
        prop_assert_eq!(round_trip::<kind::HostCoherent>(device, &data), data.clone());
        prop_assert_eq!(round_trip::<kind::HostCached>(device, &data), data.clone());
        prop_assert_eq!(round_trip::<kind::DeviceLocal>(device, &data), data.clone());
        if integrated {
            prop_assert_eq!(round_trip::<kind::Unified>(device, &data), data.clone());
        }
    }
}

#[test]
fn device_local_exchange_goes_through_staging() {
    let rig = discrete();
    let before = rig.sim.stats();
    let buffer = Buffer::<f32>::from_fn(&rig.device, 100, |i| i as f32 * 0.5).unwrap();
    let back = buffer.to_vec().unwrap();

    assert_eq!(back[99], 49.5);
    let after = rig.sim.stats();
    assert_eq!(after.copies - before.copies, 2, "one upload, one readback");
    // Staging buffers are gone again
    assert_eq!(after.buffers_created - before.buffers_created, 3);
    assert_eq!(rig.sim.live_objects(), 1 + 2);
}

#[test]
fn host_visible_exchange_is_direct() {
    let rig = discrete();
    let buffer = Buffer::<u16, kind::Host>::from_iter(&rig.device, 0..10u16).unwrap();
    assert_eq!(buffer.to_vec().unwrap(), (0..10).collect::<Vec<_>>());
    assert_eq!(rig.sim.stats().copies, 0);
}

#[test]
fn partial_exchange_touches_prefix_only() {
    let rig = discrete();
    let mut buffer = Buffer::<u32>::with_value(&rig.device, 8, 7).unwrap();
    buffer.from_host(&[1, 2, 3]).unwrap();

    let mut head = [0u32; 4];
    buffer.to_host(&mut head).unwrap();
    assert_eq!(head, [1, 2, 3, 7]);

    let mut doubled = [0u64; 8];
    buffer.to_host_with(&mut doubled, |v| u64::from(v) * 2).unwrap();
    assert_eq!(doubled, [2, 4, 6, 14, 14, 14, 14, 14]);
}

#[test]
fn oversized_exchange_is_rejected() {
    let rig = discrete();
    let mut buffer = Buffer::<u8, kind::Host>::new(&rig.device, 4).unwrap();
    assert!(matches!(
        buffer.from_host(&[0; 5]),
        Err(Error::Precondition(_))
    ));
    let mut out = [0u8; 5];
    assert!(matches!(buffer.to_host(&mut out), Err(Error::Precondition(_))));
}

#[test]
fn oversized_lengths_are_rejected() {
    let rig = discrete();
    assert!(matches!(
        Buffer::<u64, kind::Host>::new(&rig.device, usize::MAX / 4),
        Err(Error::Precondition(_))
    ));
    assert_eq!(rig.sim.stats().buffers_created, 0);
}

#[test]
fn empty_buffers_are_valid() {
    let rig = discrete();
    let buffer = Buffer::<f64>::from_slice(&rig.device, &[]).unwrap();
    assert!(buffer.is_empty());
    assert_eq!(buffer.size_bytes(), 0);
    assert!(buffer.to_vec().unwrap().is_empty());
}

#[test]
fn mapped_writes_are_visible() {
    let rig = discrete();
    let mut buffer = Buffer::<[f32; 4], kind::HostCached>::new(&rig.device, 3).unwrap();
    {
        let mut view = buffer.map().unwrap();
        assert_eq!(view.len(), 3);
        view[1] = [1.0, 2.0, 3.0, 4.0];
    }
    assert_eq!(buffer.to_vec().unwrap()[1], [1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn device_only_data_moves_by_copy() {
    let rig = discrete();
    let src = Buffer::<i64, kind::HostCoherent>::from_slice(&rig.device, &[5, -6, 7]).unwrap();
    let middle = Buffer::<i64, kind::DeviceOnly>::new(&rig.device, 3).unwrap();
    let dst = Buffer::<i64, kind::HostCached>::new(&rig.device, 3).unwrap();

    copy(&src, &middle).unwrap();
    copy(&middle, &dst).unwrap();
    assert_eq!(dst.to_vec().unwrap(), vec![5, -6, 7]);
}

#[test]
fn buffers_keep_the_device_alive() {
    let rig = discrete();
    let sim = rig.sim.clone();
    let buffer = Buffer::<u32, kind::Host>::from_slice(&rig.device, &[9; 4]).unwrap();
    drop(rig);

    assert_eq!(buffer.to_vec().unwrap(), vec![9; 4]);
    drop(buffer);
    assert_eq!(sim.live_objects(), 0);
}
