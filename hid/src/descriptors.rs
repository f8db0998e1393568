// Copyright 2024 SuperHID Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! USB descriptors for the fabricated SuperHID device.
//!
//! Every length that depends on another descriptor (wTotalLength, the HID
//! class descriptor's report length, the endpoint packet size) is computed
//! when the catalog is built, so a constructed `DescriptorSet` is always
//! internally consistent.

use vm_memory::ByteValued;

use crate::DeviceType;
use crate::report_desc;
use crate::reports::REPORT_LENGTH;

// ============================================================================
// USB Constants
// ============================================================================

/// Vendor id of the fabricated device.
pub const USB_VENDOR_ID: u16 = 0x4242;

/// Product id of the fabricated device.
pub const USB_PRODUCT_ID: u16 = 0x4242;

/// ASCII name served for string descriptor requests.
pub const PRODUCT_NAME: &str = "SuperHID";

/// USB HID device class
pub const USB_CLASS_HID: u8 = 0x03;

/// HID subclass for boot interface
pub const HID_SUBCLASS_BOOT: u8 = 0x01;

/// HID protocol for mouse
pub const HID_PROTOCOL_MOUSE: u8 = 0x02;

/// USB endpoint direction: IN (device to host)
pub const USB_DIR_IN: u8 = 0x80;

/// USB endpoint type: interrupt
pub const USB_ENDPOINT_XFER_INT: u8 = 0x03;

/// Configuration attribute: USB 1.x mandatory bit
pub const USB_CONFIG_ATT_ONE: u8 = 0x80;

/// Configuration attribute: remote wakeup capable
pub const USB_CONFIG_ATT_WAKEUP: u8 = 0x20;

/// Descriptor type codes used in GET_DESCRIPTOR requests.
pub mod descriptor_type {
    pub const DEVICE: u8 = 0x01;
    pub const CONFIG: u8 = 0x02;
    pub const STRING: u8 = 0x03;
    pub const INTERFACE: u8 = 0x04;
    pub const ENDPOINT: u8 = 0x05;
    pub const QUALIFIER: u8 = 0x06;
    pub const BOS: u8 = 0x0F;
    pub const HID: u8 = 0x21;
    pub const REPORT: u8 = 0x22;
}

// ============================================================================
// USB Descriptors
// ============================================================================

/// USB device descriptor
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct UsbDeviceDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub bcd_usb: u16,
    pub b_device_class: u8,
    pub b_device_sub_class: u8,
    pub b_device_protocol: u8,
    pub b_max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
    pub b_num_configurations: u8,
}

// SAFETY: UsbDeviceDescriptor is POD and has no implicit padding
unsafe impl ByteValued for UsbDeviceDescriptor {}

/// USB device qualifier descriptor
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct UsbQualifierDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub bcd_usb: u16,
    pub b_device_class: u8,
    pub b_device_sub_class: u8,
    pub b_device_protocol: u8,
    pub b_max_packet_size0: u8,
    pub b_num_configurations: u8,
    pub b_reserved: u8,
}

// SAFETY: UsbQualifierDescriptor is POD and has no implicit padding
unsafe impl ByteValued for UsbQualifierDescriptor {}

/// USB configuration descriptor
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct UsbConfigDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub w_total_length: u16,
    pub b_num_interfaces: u8,
    pub b_configuration_value: u8,
    pub i_configuration: u8,
    pub bm_attributes: u8,
    pub b_max_power: u8,
}

// SAFETY: UsbConfigDescriptor is POD and has no implicit padding
unsafe impl ByteValued for UsbConfigDescriptor {}

/// USB interface descriptor
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct UsbInterfaceDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_interface_number: u8,
    pub b_alternate_setting: u8,
    pub b_num_endpoints: u8,
    pub b_interface_class: u8,
    pub b_interface_sub_class: u8,
    pub b_interface_protocol: u8,
    pub i_interface: u8,
}

// SAFETY: UsbInterfaceDescriptor is POD and has no implicit padding
unsafe impl ByteValued for UsbInterfaceDescriptor {}

/// HID class descriptor (the 9-byte form with one subordinate entry)
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct HidDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub bcd_hid: u16,
    pub b_country_code: u8,
    pub b_num_descriptors: u8,
    pub b_add_descriptor_type: u8,
    pub w_add_descriptor_length: u16,
}

// SAFETY: HidDescriptor is POD and has no implicit padding
unsafe impl ByteValued for HidDescriptor {}

/// USB endpoint descriptor
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct UsbEndpointDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_endpoint_address: u8,
    pub bm_attributes: u8,
    pub w_max_packet_size: u16,
    pub b_interval: u8,
}

// SAFETY: UsbEndpointDescriptor is POD and has no implicit padding
unsafe impl ByteValued for UsbEndpointDescriptor {}

/// USB binary object store descriptor (header only, no capabilities)
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct UsbBosDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub w_total_length: u16,
    pub b_num_device_caps: u8,
}

// SAFETY: UsbBosDescriptor is POD and has no implicit padding
unsafe impl ByteValued for UsbBosDescriptor {}

// ============================================================================
// Descriptor Catalog
// ============================================================================

/// The complete descriptor set of one SuperHID device flavour.
pub struct DescriptorSet {
    pub device: UsbDeviceDescriptor,
    pub qualifier: UsbQualifierDescriptor,
    pub config: UsbConfigDescriptor,
    pub interface: UsbInterfaceDescriptor,
    pub hid: HidDescriptor,
    pub endpoint: UsbEndpointDescriptor,
    pub report_desc: Vec<u8>,
}

impl DescriptorSet {
    fn new(report_desc: Vec<u8>) -> Self {
        let device = UsbDeviceDescriptor {
            b_length: size_of::<UsbDeviceDescriptor>() as u8,
            b_descriptor_type: descriptor_type::DEVICE,
            bcd_usb: 0x0200, // USB 2.0
            b_device_class: 0x00, // Defined at interface level
            b_device_sub_class: 0x00,
            b_device_protocol: 0x00,
            b_max_packet_size0: 64,
            id_vendor: USB_VENDOR_ID,
            id_product: USB_PRODUCT_ID,
            bcd_device: 0x0001,
            i_manufacturer: 0,
            i_product: 0,
            i_serial_number: 0,
            b_num_configurations: 1,
        };

        let qualifier = UsbQualifierDescriptor {
            b_length: size_of::<UsbQualifierDescriptor>() as u8,
            b_descriptor_type: descriptor_type::QUALIFIER,
            bcd_usb: 0x0200,
            b_device_class: 0x00,
            b_device_sub_class: 0x00,
            b_device_protocol: 0x00,
            b_max_packet_size0: 64,
            b_num_configurations: 1,
            b_reserved: 0,
        };

        let total_length = size_of::<UsbConfigDescriptor>()
            + size_of::<UsbInterfaceDescriptor>()
            + size_of::<HidDescriptor>()
            + size_of::<UsbEndpointDescriptor>();
        let config = UsbConfigDescriptor {
            b_length: size_of::<UsbConfigDescriptor>() as u8,
            b_descriptor_type: descriptor_type::CONFIG,
            w_total_length: total_length as u16,
            b_num_interfaces: 1,
            b_configuration_value: 1,
            i_configuration: 0,
            bm_attributes: USB_CONFIG_ATT_ONE | USB_CONFIG_ATT_WAKEUP,
            b_max_power: 50, // 100mA
        };

        let interface = UsbInterfaceDescriptor {
            b_length: size_of::<UsbInterfaceDescriptor>() as u8,
            b_descriptor_type: descriptor_type::INTERFACE,
            b_interface_number: 0,
            b_alternate_setting: 0,
            b_num_endpoints: 1,
            b_interface_class: USB_CLASS_HID,
            b_interface_sub_class: HID_SUBCLASS_BOOT,
            b_interface_protocol: HID_PROTOCOL_MOUSE,
            i_interface: 0,
        };

        let hid = HidDescriptor {
            b_length: size_of::<HidDescriptor>() as u8,
            b_descriptor_type: descriptor_type::HID,
            bcd_hid: 0x0111,
            b_country_code: 0x00,
            b_num_descriptors: 1,
            b_add_descriptor_type: descriptor_type::REPORT,
            w_add_descriptor_length: report_desc.len() as u16,
        };

        let endpoint = UsbEndpointDescriptor {
            b_length: size_of::<UsbEndpointDescriptor>() as u8,
            b_descriptor_type: descriptor_type::ENDPOINT,
            b_endpoint_address: USB_DIR_IN | 0x01, // EP1 IN
            bm_attributes: USB_ENDPOINT_XFER_INT,
            w_max_packet_size: REPORT_LENGTH as u16,
            b_interval: 1,
        };

        Self {
            device,
            qualifier,
            config,
            interface,
            hid,
            endpoint,
            report_desc,
        }
    }

    /// Full configuration blob: config, interface, HID class and endpoint
    /// descriptors back to back, `w_total_length` bytes long.
    pub fn configuration_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(usize::from(self.config.w_total_length));
        buf.extend_from_slice(self.config.as_slice());
        buf.extend_from_slice(self.interface.as_slice());
        buf.extend_from_slice(self.hid.as_slice());
        buf.extend_from_slice(self.endpoint.as_slice());
        buf
    }
}

/// Descriptor sets for all five device flavours, built once at startup.
pub struct DescriptorCatalog {
    multi: DescriptorSet,
    mouse: DescriptorSet,
    digitizer: DescriptorSet,
    tablet: DescriptorSet,
    keyboard: DescriptorSet,
    bos: UsbBosDescriptor,
}

impl DescriptorCatalog {
    pub fn new() -> Self {
        Self {
            multi: DescriptorSet::new(report_desc::multi_report_descriptor()),
            mouse: DescriptorSet::new(report_desc::mouse_report_descriptor()),
            digitizer: DescriptorSet::new(report_desc::digitizer_report_descriptor()),
            tablet: DescriptorSet::new(report_desc::tablet_report_descriptor()),
            keyboard: DescriptorSet::new(report_desc::keyboard_report_descriptor()),
            bos: UsbBosDescriptor {
                b_length: size_of::<UsbBosDescriptor>() as u8,
                b_descriptor_type: descriptor_type::BOS,
                w_total_length: size_of::<UsbBosDescriptor>() as u16,
                b_num_device_caps: 0,
            },
        }
    }

    /// The descriptor set of one device flavour.
    pub fn for_type(&self, typ: DeviceType) -> &DescriptorSet {
        match typ {
            DeviceType::Multi => &self.multi,
            DeviceType::Mouse => &self.mouse,
            DeviceType::Digitizer => &self.digitizer,
            DeviceType::Tablet => &self.tablet,
            DeviceType::Keyboard => &self.keyboard,
        }
    }

    pub fn bos(&self) -> &UsbBosDescriptor {
        &self.bos
    }
}

impl Default for DescriptorCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_sizes() {
        assert_eq!(size_of::<UsbDeviceDescriptor>(), 18);
        assert_eq!(size_of::<UsbQualifierDescriptor>(), 10);
        assert_eq!(size_of::<UsbConfigDescriptor>(), 9);
        assert_eq!(size_of::<UsbInterfaceDescriptor>(), 9);
        assert_eq!(size_of::<HidDescriptor>(), 9);
        assert_eq!(size_of::<UsbEndpointDescriptor>(), 7);
        assert_eq!(size_of::<UsbBosDescriptor>(), 5);
    }

    #[test]
    fn test_total_length() {
        let catalog = DescriptorCatalog::new();
        for typ in [
            DeviceType::Multi,
            DeviceType::Mouse,
            DeviceType::Digitizer,
            DeviceType::Tablet,
            DeviceType::Keyboard,
        ] {
            let set = catalog.for_type(typ);
            let total = set.config.w_total_length;
            assert_eq!(total, 34);
            assert_eq!(set.configuration_bytes().len(), 34);
        }
    }

    #[test]
    fn test_report_descriptor_length_matches() {
        let catalog = DescriptorCatalog::new();
        for typ in [
            DeviceType::Multi,
            DeviceType::Mouse,
            DeviceType::Digitizer,
            DeviceType::Tablet,
            DeviceType::Keyboard,
        ] {
            let set = catalog.for_type(typ);
            let hid_len = set.hid.w_add_descriptor_length;
            assert_eq!(usize::from(hid_len), set.report_desc.len());
        }
    }

    #[test]
    fn test_device_identity() {
        let catalog = DescriptorCatalog::new();
        let dev = catalog.for_type(DeviceType::Multi).device;
        let vendor = dev.id_vendor;
        let product = dev.id_product;
        assert_eq!(vendor, 0x4242);
        assert_eq!(product, 0x4242);
        assert_eq!(dev.b_max_packet_size0, 64);
        assert_eq!(dev.b_num_configurations, 1);
    }

    #[test]
    fn test_endpoint_shape() {
        let catalog = DescriptorCatalog::new();
        let ep = catalog.for_type(DeviceType::Keyboard).endpoint;
        assert_eq!(ep.b_endpoint_address, 0x81);
        assert_eq!(ep.bm_attributes, USB_ENDPOINT_XFER_INT);
        let max = ep.w_max_packet_size;
        assert_eq!(usize::from(max), REPORT_LENGTH);
        assert_eq!(ep.b_interval, 1);
    }

    #[test]
    fn test_configuration_bytes_layout() {
        let catalog = DescriptorCatalog::new();
        let bytes = catalog.for_type(DeviceType::Mouse).configuration_bytes();
        // Each nested descriptor announces its own length and type.
        assert_eq!(&bytes[0..2], &[9, descriptor_type::CONFIG]);
        assert_eq!(&bytes[9..11], &[9, descriptor_type::INTERFACE]);
        assert_eq!(&bytes[18..20], &[9, descriptor_type::HID]);
        assert_eq!(&bytes[27..29], &[7, descriptor_type::ENDPOINT]);
        // The HID class descriptor reports the mouse report descriptor size.
        assert_eq!(
            u16::from_le_bytes([bytes[25], bytes[26]]),
            report_desc::mouse_report_descriptor().len() as u16
        );
    }
}
