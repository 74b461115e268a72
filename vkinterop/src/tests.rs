// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

#![cfg(all(test, unix))]

/// Creates the physical device of a soft instance.
macro_rules! soft_physical_device {
    () => {
        soft_physical_device!($crate::driver::soft::SoftDriverConfig::default())
    };
    ($config:expr) => {{
        use $crate::device::{Backend, Instance, InstanceCreateInfo};

        let instance = match Instance::new(Backend::Soft($config), InstanceCreateInfo::default()) {
            Ok(instance) => instance,
            Err(_) => return,
        };

        match instance.enumerate_physical_devices().ok().and_then(|mut p| p.next()) {
            Some(physical_device) => physical_device,
            None => return,
        }
    }};
}

/// Creates a device and its queue on the soft driver, with the given extensions enabled.
macro_rules! soft_device {
    ($extensions:expr) => {
        soft_device!($extensions, $crate::driver::soft::SoftDriverConfig::default())
    };
    ($extensions:expr, $config:expr) => {{
        use $crate::device::{Device, DeviceCreateInfo};

        let physical_device = soft_physical_device!($config);

        match Device::new(
            physical_device,
            DeviceCreateInfo {
                enabled_extensions: $extensions,
                ..Default::default()
            },
        ) {
            Ok(r) => r,
            Err(_) => return,
        }
    }};
}

/// Creates a device and its queue on the Vulkan implementation of the system, or returns if
/// there is none or it lacks the extensions.
macro_rules! vulkan_device {
    ($extensions:expr) => {{
        use $crate::device::{Backend, Device, DeviceCreateInfo, Instance, InstanceCreateInfo};

        let instance = match Instance::new(Backend::Vulkan, InstanceCreateInfo::default()) {
            Ok(instance) => instance,
            Err(_) => return,
        };

        let physical_device = match instance
            .enumerate_physical_devices()
            .ok()
            .and_then(|mut p| p.next())
        {
            Some(physical_device) => physical_device,
            None => return,
        };

        match Device::new(
            physical_device,
            DeviceCreateInfo {
                enabled_extensions: $extensions,
                ..Default::default()
            },
        ) {
            Ok(r) => r,
            Err(_) => return,
        }
    }};
}
