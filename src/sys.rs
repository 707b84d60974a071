//! System native types and constants.

#![allow(non_camel_case_types)]

use libc::{c_ushort, sa_family_t};

pub const AF_BLUETOOTH: i32 = 31;
pub const BTPROTO_HCI: i32 = 1;

pub const HCI_DEV_NONE: c_ushort = 0xffff;
pub const HCI_CHANNEL_CONTROL: c_ushort = 3;

#[repr(packed)]
#[repr(C)]
#[derive(Clone)]
pub struct bdaddr_t {
    pub b: [u8; 6],
}

pub const BDADDR_LE_PUBLIC: u8 = 0x01;
pub const BDADDR_LE_RANDOM: u8 = 0x02;

#[repr(C)]
#[derive(Clone)]
pub struct sockaddr_hci {
    pub hci_family: sa_family_t,
    pub hci_dev: c_ushort,
    pub hci_channel: c_ushort,
}
