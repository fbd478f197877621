//! 同步互斥模块。

#![cfg_attr(not(test), no_std)]
#![deny(warnings, missing_docs)]

mod up;
mod wait;

extern crate alloc;

pub use up::{UPIntrFreeCell, UPIntrRefMut};
pub use wait::WaitQueue;
