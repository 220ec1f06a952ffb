// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod down;
pub mod status;
pub mod up;

pub use down::{handle_down, DownArgs};
pub use status::handle_status;
pub use up::{handle_up, UpArgs};
