//! GameCube adapter proxy service
//!
//! Hosts the adapter virtualization engine ([`usb`]) together with the
//! service plumbing around it: configuration, call capture and systemd
//! integration.

pub mod capture;
pub mod config;
pub mod service;
pub mod usb;
