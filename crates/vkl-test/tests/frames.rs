//! Frame pipeline and swapchain scenarios on the software adapter.

use ash::vk;
use vkl_gpu::{ErrorClass, GpuError, SlotState};
use vkl_test::{RigConfig, SoftwareRig};

#[test]
fn ten_frames_alternate_slots_and_present_once_each() {
    let mut rig = SoftwareRig::new(RigConfig::default()).unwrap();
    assert_eq!(rig.runtime().swapchain().image_count(), 2);

    let frames = rig.run_frames(10).unwrap();
    let slots = frames
        .iter()
        .map(|f| f.slot.to_string())
        .collect::<Vec<_>>()
        .join(",");
    insta::assert_snapshot!(slots, @"0,1,0,1,0,1,0,1,0,1");

    let presents = rig.probe().presents();
    assert_eq!(presents.len(), 10);
    assert!(presents.iter().all(|p| p.generation == 1));
    assert_eq!(rig.probe().submit_count(), 10);

    rig.shutdown().unwrap();
}

#[test]
fn frames_in_flight_never_exceed_slot_count() {
    for frames_in_flight in 1..=3 {
        let mut rig = SoftwareRig::new(
            RigConfig::default()
                .with_frames_in_flight(frames_in_flight)
                .with_image_count(3),
        )
        .unwrap();

        for _ in 0..12 {
            rig.run_frame().unwrap();
            let busy = rig
                .runtime()
                .frames()
                .slot_states()
                .iter()
                .filter(|s| **s != SlotState::Idle)
                .count();
            assert!(busy <= frames_in_flight);
            assert!(rig.probe().in_flight() <= frames_in_flight);
        }
        // Work only completes when the CPU waits, so the bound is reached exactly
        assert_eq!(rig.probe().max_in_flight(), frames_in_flight);

        rig.shutdown().unwrap();
    }
}

#[test]
fn more_images_than_slots_use_a_semaphore_per_image() {
    let mut rig = SoftwareRig::new(RigConfig::default().with_image_count(3)).unwrap();
    let swapchain = rig.runtime().swapchain();
    assert_eq!(swapchain.image_count(), 3);
    assert_eq!(rig.runtime().frames().frames_in_flight(), 2);

    let semaphores: Vec<_> = (0..3)
        .map(|index| swapchain.render_finished(index).unwrap())
        .collect();
    assert!(semaphores[0] != semaphores[1] && semaphores[1] != semaphores[2]);
    assert!(semaphores[0] != semaphores[2]);
    assert!(swapchain.render_finished(3).is_none());

    // Slots cycle over two, images over three, so a slot meets a new image
    // while the presentation of its last one may still wait
    let frames = rig.run_frames(9).unwrap();
    let pairs = frames
        .iter()
        .map(|f| format!("{}:{}", f.slot, f.image_index))
        .collect::<Vec<_>>()
        .join(",");
    insta::assert_snapshot!(pairs, @"0:0,1:1,0:2,1:0,0:1,1:2,0:0,1:1,0:2");
    assert!(rig.probe().violations().is_empty());

    rig.rebuild().unwrap();
    rig.run_frames(3).unwrap();
    rig.shutdown().unwrap();
}

#[test]
fn acquire_timeout_is_retryable_on_the_same_slot() {
    let mut rig = SoftwareRig::new(RigConfig::default()).unwrap();
    rig.run_frame().unwrap();

    rig.probe().inject_acquire_error(vk::Result::TIMEOUT);
    let err = rig.runtime_mut().begin_frame().unwrap_err();
    assert!(matches!(err, GpuError::Timeout));
    assert_eq!(err.class(), ErrorClass::Transient);
    assert!(!err.requires_rebuild());

    let frames = rig.runtime().frames();
    assert!(frames.active_frame().is_none());
    assert_eq!(frames.current_slot(), 1);
    assert_eq!(frames.slot_states()[1], SlotState::Idle);
    assert!(rig.probe().violations().is_empty());

    let frame = rig.run_frame().unwrap();
    assert_eq!(frame.slot, 1);
    assert_eq!(frame.frame_number, 1);
    rig.shutdown().unwrap();
}

#[test]
fn zero_extent_rebuild_keeps_the_current_swapchain() {
    let mut rig = SoftwareRig::new(RigConfig::default()).unwrap();
    rig.run_frames(2).unwrap();
    let images = rig.runtime().swapchain().images().to_vec();

    // Minimized window
    rig.resize(0, 0);
    let err = rig
        .runtime_mut()
        .rebuild(vk::Extent2D {
            width: 0,
            height: 0,
        })
        .unwrap_err();
    assert!(matches!(err, GpuError::SurfaceIncompatible(_)));

    let swapchain = rig.runtime().swapchain();
    assert_eq!(swapchain.generation(), 1);
    assert_eq!(swapchain.images(), images.as_slice());
    assert_ne!(swapchain.handle(), vk::SwapchainKHR::null());

    // Restored to the old size: the old generation still presents
    rig.resize(800, 600);
    let frames = rig.run_frames(2).unwrap();
    assert!(frames.iter().all(|f| images.contains(&f.image)));
    assert!(rig.probe().presents().iter().all(|p| p.generation == 1));

    rig.resize(1024, 768);
    rig.rebuild().unwrap();
    assert_eq!(rig.runtime().swapchain().generation(), 2);
    rig.run_frame().unwrap();
    rig.shutdown().unwrap();
}

#[test]
fn failed_fence_reset_releases_the_acquire_signal() {
    let mut rig = SoftwareRig::new(RigConfig::default()).unwrap();
    rig.run_frame().unwrap();

    rig.probe()
        .inject_fence_reset_error(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
    let err = rig.runtime_mut().begin_frame().unwrap_err();
    assert!(matches!(
        err,
        GpuError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
    ));

    let frames = rig.runtime().frames();
    assert!(frames.active_frame().is_none());
    assert_eq!(frames.current_slot(), 1);
    assert_eq!(frames.slot_states()[1], SlotState::Idle);

    // Same slot again: its semaphore must not still carry the first signal
    let frame = rig.run_frame().unwrap();
    assert_eq!(frame.slot, 1);
    assert_eq!(frame.frame_number, 1);
    assert!(rig.probe().violations().is_empty());

    // The image from the failed call is reclaimed by a rebuild
    rig.rebuild().unwrap();
    rig.run_frames(3).unwrap();
    rig.shutdown().unwrap();
}

#[test]
fn out_of_date_acquire_then_rebuild_never_reuses_old_images() {
    let mut rig = SoftwareRig::new(RigConfig::default()).unwrap();
    rig.run_frames(3).unwrap();
    let old_images = rig.runtime().swapchain().images().to_vec();

    rig.probe()
        .inject_acquire_error(vk::Result::ERROR_OUT_OF_DATE_KHR);
    let err = rig.runtime_mut().begin_frame().unwrap_err();
    assert!(matches!(err, GpuError::OutOfDate));
    assert!(err.requires_rebuild());

    rig.rebuild().unwrap();
    assert_eq!(rig.runtime().swapchain().generation(), 2);

    let presents_before = rig.probe().presents().len();
    let frames = rig.run_frames(6).unwrap();
    assert!(frames.iter().all(|f| !old_images.contains(&f.image)));

    let presents = rig.probe().presents();
    assert_eq!(presents.len(), presents_before + 6);
    assert!(presents[presents_before..]
        .iter()
        .all(|p| p.generation == 2 && !old_images.contains(&p.image)));

    rig.shutdown().unwrap();
}

#[test]
fn resize_reports_out_of_date_and_rebuild_uses_new_extent() {
    let mut rig = SoftwareRig::new(RigConfig::default()).unwrap();
    rig.run_frames(2).unwrap();
    let old_images = rig.runtime().swapchain().images().to_vec();

    rig.resize(1280, 720);
    let err = rig.runtime_mut().begin_frame().unwrap_err();
    assert!(matches!(err, GpuError::OutOfDate));

    rig.rebuild().unwrap();
    let acquires_before = rig.probe().acquires().len();
    let frame = rig.run_frame().unwrap();
    assert_eq!(
        frame.extent,
        vk::Extent2D {
            width: 1280,
            height: 720
        }
    );
    assert!(!old_images.contains(&frame.image));
    assert!(rig.probe().acquires()[acquires_before..]
        .iter()
        .all(|a| a.generation == 2));

    rig.shutdown().unwrap();
}

#[test]
fn out_of_date_present_still_ends_the_frame() {
    let mut rig = SoftwareRig::new(RigConfig::default()).unwrap();
    rig.run_frame().unwrap();

    rig.runtime_mut().begin_frame().unwrap();
    rig.resize(640, 480);
    let err = rig.runtime_mut().end_frame().unwrap_err();
    assert!(matches!(err, GpuError::OutOfDate));
    assert!(rig.runtime().frames().active_frame().is_none());
    assert_eq!(rig.runtime().frames().frame_number(), 2);

    rig.rebuild().unwrap();
    rig.run_frames(3).unwrap();
    rig.shutdown().unwrap();
}

#[test]
fn suboptimal_present_is_reported_after_queueing() {
    let mut rig = SoftwareRig::new(RigConfig::default()).unwrap();
    rig.probe().set_suboptimal(true);

    let frame = rig.runtime_mut().begin_frame().unwrap();
    assert!(frame.suboptimal);
    let err = rig.runtime_mut().end_frame().unwrap_err();
    assert!(matches!(err, GpuError::Suboptimal));
    assert_eq!(rig.probe().presents().len(), 1);

    rig.rebuild().unwrap();
    let frame = rig.run_frame().unwrap();
    assert!(!frame.suboptimal);

    rig.shutdown().unwrap();
}

#[test]
fn hung_gpu_times_out_then_recovers() {
    let mut rig = SoftwareRig::new(RigConfig::default()).unwrap();
    rig.run_frames(2).unwrap();

    rig.probe().set_hung(true);
    let err = rig.runtime_mut().begin_frame().unwrap_err();
    assert!(matches!(err, GpuError::FrameTimeout { slot: 0, .. }));
    assert!(!err.is_fatal());
    assert!(rig.runtime().frames().active_frame().is_none());

    rig.probe().set_hung(false);
    let frame = rig.run_frame().unwrap();
    assert_eq!(frame.slot, 0);
    assert_eq!(frame.frame_number, 2);

    rig.shutdown().unwrap();
}

#[test]
fn device_loss_is_fatal_and_teardown_still_completes() {
    let mut rig = SoftwareRig::new(RigConfig::default()).unwrap();
    rig.run_frames(2).unwrap();

    rig.probe().lose_device();
    let err = rig.runtime_mut().begin_frame().unwrap_err();
    assert!(matches!(err, GpuError::DeviceLost));
    assert!(err.is_fatal());

    let probe = rig.probe().clone();
    rig.shutdown().unwrap();
    assert!(!probe.has_device());
}

#[test]
fn cancelled_frame_keeps_slots_consistent() {
    let mut rig = SoftwareRig::new(RigConfig::default()).unwrap();
    rig.run_frame().unwrap();

    rig.runtime_mut().begin_frame().unwrap();
    rig.runtime_mut().cancel_frame().unwrap();
    assert_eq!(rig.probe().presents().len(), 1);

    let frames = rig.run_frames(4).unwrap();
    assert_eq!(frames[0].slot, 0);
    assert_eq!(frames[0].frame_number, 2);

    rig.rebuild().unwrap();
    rig.run_frames(2).unwrap();
    rig.shutdown().unwrap();
}

#[test]
fn failed_submission_leaves_slot_reusable() {
    let mut rig = SoftwareRig::new(RigConfig::default()).unwrap();
    rig.run_frame().unwrap();

    rig.runtime_mut().begin_frame().unwrap();
    rig.probe()
        .inject_submit_error(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
    let err = rig.runtime_mut().end_frame().unwrap_err();
    assert!(matches!(
        err,
        GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
    ));

    // The acquired image was never presented; a rebuild reclaims it
    rig.rebuild().unwrap();
    let frame = rig.run_frame().unwrap();
    assert_eq!(frame.slot, 1);
    rig.shutdown().unwrap();
}

#[test]
fn record_outside_a_frame_is_rejected() {
    let mut rig = SoftwareRig::new(RigConfig::default()).unwrap();
    let err = rig.runtime_mut().record(|_, _| ()).unwrap_err();
    assert!(matches!(err, GpuError::InvalidState(_)));
    assert!(rig.runtime_mut().end_frame().is_err());
    rig.shutdown().unwrap();
}
