//! Dispatch bootstrap and device context scenarios.

use ash::vk;
use vkl_gpu::software::SoftwareQueueFamily;
use vkl_gpu::{
    DeviceContextBuilder, DeviceRequirements, GpuError, QueueRole, SoftwareAdapterDesc,
    SoftwareDriver, SoftwareSurface,
};
use vkl_test::{init_test_logging, RigConfig, SoftwareRig};

#[test]
fn second_context_fails_and_first_keeps_working() {
    let mut rig = SoftwareRig::new(RigConfig::default()).unwrap();
    rig.run_frames(2).unwrap();

    let err = DeviceContextBuilder::new()
        .build(rig.driver(), &SoftwareSurface::default())
        .unwrap_err();
    assert!(matches!(err, GpuError::DoubleInit));
    assert!(err.is_fatal());
    // The failed attempt never reached the driver
    assert_eq!(rig.probe().bootstrap_count(), 1);

    let frames = rig.run_frames(4).unwrap();
    assert_eq!(frames.len(), 4);
    assert_eq!(rig.probe().presents().len(), 6);
    rig.shutdown().unwrap();
}

#[test]
fn context_can_be_created_again_after_teardown() {
    let rig = SoftwareRig::new(RigConfig::default()).unwrap();
    let driver = rig.driver();
    let probe = driver.probe();
    rig.shutdown().unwrap();

    let ctx = DeviceContextBuilder::new()
        .build(driver, &SoftwareSurface::default())
        .unwrap();
    assert_eq!(probe.bootstrap_count(), 2);
    ctx.wait_idle().unwrap();
    drop(ctx);

    assert!(probe.violations().is_empty());
}

#[test]
fn failed_bootstrap_releases_the_dispatch_slot() {
    init_test_logging();
    let driver = SoftwareDriver::default();
    let probe = driver.probe();
    probe.fail_next_bootstrap("loader missing");

    let err = DeviceContextBuilder::new()
        .build(driver.clone(), &SoftwareSurface::default())
        .unwrap_err();
    assert!(matches!(err, GpuError::DriverInit(ref reason) if reason.contains("loader missing")));

    let ctx = DeviceContextBuilder::new()
        .build(driver, &SoftwareSurface::default())
        .unwrap();
    assert_eq!(ctx.adapter().name, "Software Adapter");
}

#[test]
fn missing_extension_means_no_suitable_device() {
    init_test_logging();
    let adapter = SoftwareAdapterDesc::default().with_extensions(Vec::new());
    let driver = SoftwareDriver::new(vec![adapter]);
    let probe = driver.probe();

    let err = DeviceContextBuilder::new()
        .build(driver, &SoftwareSurface::default())
        .unwrap_err();
    assert!(matches!(err, GpuError::NoSuitableDevice(_)));
    assert!(!probe.has_device());
    assert_eq!(probe.live_objects(), 0);
}

#[test]
fn discrete_adapter_is_preferred() {
    let adapters = vec![
        SoftwareAdapterDesc::default().with_name("Fallback CPU"),
        SoftwareAdapterDesc::default()
            .with_name("Discrete")
            .with_device_type(vk::PhysicalDeviceType::DISCRETE_GPU),
    ];
    let rig = SoftwareRig::new(RigConfig::default().with_adapters(adapters)).unwrap();
    assert_eq!(rig.runtime().context().adapter().name, "Discrete");
    rig.shutdown().unwrap();
}

#[test]
fn api_version_requirement_filters_adapters() {
    let adapters = vec![
        SoftwareAdapterDesc::default()
            .with_name("Old")
            .with_device_type(vk::PhysicalDeviceType::DISCRETE_GPU)
            .with_api_version(vk::API_VERSION_1_1),
        SoftwareAdapterDesc::default().with_name("Current"),
    ];
    let requirements = DeviceRequirements::default().with_min_api_version(vk::API_VERSION_1_3);
    let rig = SoftwareRig::new(
        RigConfig::default()
            .with_adapters(adapters)
            .with_requirements(requirements),
    )
    .unwrap();
    assert_eq!(rig.runtime().context().adapter().name, "Current");
    rig.shutdown().unwrap();
}

#[test]
fn separate_present_family_shares_swapchain_images() {
    let families = vec![
        SoftwareQueueFamily {
            flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER,
            queue_count: 1,
            supports_present: false,
        },
        SoftwareQueueFamily {
            flags: vk::QueueFlags::COMPUTE,
            queue_count: 1,
            supports_present: true,
        },
    ];
    let adapter = SoftwareAdapterDesc::default().with_queue_families(families);
    let mut rig = SoftwareRig::new(RigConfig::default().with_adapters(vec![adapter])).unwrap();

    let ctx = rig.runtime().context();
    assert_eq!(ctx.queue_family(QueueRole::Graphics), 0);
    assert_eq!(ctx.queue_family(QueueRole::Present), 1);
    assert_ne!(ctx.graphics_queue(), ctx.present_queue());

    rig.run_frames(4).unwrap();
    assert_eq!(rig.probe().presents().len(), 4);
    rig.shutdown().unwrap();
}
