//! Command channel to the raw-gadget driver
//!
//! Every driver command is one `ioctl(2)` on the driver file. The channel is
//! a trait so the client can run against a scripted fake in tests.

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::errno::Errno;
use tracing::trace;

/// Argument handed to the ioctl syscall
#[derive(Debug)]
pub enum IoctlArg<'a> {
    /// Null argument
    None,
    /// Scalar passed by value
    Value(u32),
    /// Pointer to a buffer the kernel reads and/or writes in place
    Buffer(&'a mut [u8]),
}

/// Submits encoded commands to the driver
pub trait DeviceCommandChannel {
    /// Issue one ioctl. Returns the syscall's non-negative result.
    fn submit(&mut self, request: u32, arg: IoctlArg<'_>) -> nix::Result<i32>;
}

/// Channel backed by the real driver file descriptor
///
/// Drop closes the fd, which invalidates every endpoint handle the kernel
/// assigned through it.
#[derive(Debug)]
pub struct DriverChannel {
    fd: OwnedFd,
}

impl DriverChannel {
    /// Open the driver node (normally `/dev/raw-gadget`)
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)?;
        Ok(Self { fd: file.into() })
    }
}

impl DeviceCommandChannel for DriverChannel {
    fn submit(&mut self, request: u32, arg: IoctlArg<'_>) -> nix::Result<i32> {
        let fd = self.fd.as_raw_fd();
        trace!("ioctl fd={} request={:#010x}", fd, request);

        // SAFETY: the request code encodes the buffer size the kernel will
        // touch, and every buffer is allocated with at least that size.
        let ret = unsafe {
            match arg {
                IoctlArg::None => libc::ioctl(fd, request as _, 0 as libc::c_ulong),
                IoctlArg::Value(v) => libc::ioctl(fd, request as _, v as libc::c_ulong),
                IoctlArg::Buffer(buf) => libc::ioctl(fd, request as _, buf.as_mut_ptr()),
            }
        };

        Errno::result(ret)
    }
}
