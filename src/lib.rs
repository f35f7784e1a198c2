//! Core library for the multicam_daq application.
//!
//! This library coordinates hardware-synchronized video acquisition from a
//! heterogeneous set of cameras. A microcontroller drives camera triggers and
//! lights from a per-cycle schedule computed by [`schedule`]; one capture
//! worker per camera pulls frames from its device and one encoder worker per
//! stream pipes pixels into a video encoder, with metadata written alongside.

pub mod acquisition;
pub mod camera;
pub mod config;
pub mod display;
pub mod error;
pub mod logging;
pub mod microcontroller;
pub mod paths;
pub mod schedule;
pub mod session;
pub mod writer;
