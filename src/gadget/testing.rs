//! Scripted command channel for unit tests

use std::collections::{HashMap, VecDeque};

use super::channel::{DeviceCommandChannel, IoctlArg};
use super::ioctl::{decode_request_code, Command};

/// Argument as the fake saw it on submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedArg {
    None,
    Value(u32),
    Buffer(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct Call {
    pub code: u32,
    pub number: u8,
    pub arg: RecordedArg,
}

#[derive(Debug)]
struct Reply {
    ret: nix::Result<i32>,
    fill: Option<Vec<u8>>,
}

/// Records every request and answers from per-command reply queues.
///
/// Commands without a queued reply succeed with 0.
#[derive(Debug, Default)]
pub struct FakeChannel {
    pub calls: Vec<Call>,
    replies: HashMap<u8, VecDeque<Reply>>,
}

impl FakeChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for `cmd`; `fill` is copied over the ioctl buffer
    pub fn reply(&mut self, cmd: &Command, ret: nix::Result<i32>, fill: Option<Vec<u8>>) {
        self.replies
            .entry(cmd.number)
            .or_default()
            .push_back(Reply { ret, fill });
    }

    pub fn calls_to(&self, cmd: &Command) -> Vec<&Call> {
        self.calls.iter().filter(|c| c.number == cmd.number).collect()
    }

    pub fn count(&self, cmd: &Command) -> usize {
        self.calls_to(cmd).len()
    }
}

impl DeviceCommandChannel for FakeChannel {
    fn submit(&mut self, request: u32, arg: IoctlArg<'_>) -> nix::Result<i32> {
        let (_, _, number, _) = decode_request_code(request);
        let recorded = match &arg {
            IoctlArg::None => RecordedArg::None,
            IoctlArg::Value(v) => RecordedArg::Value(*v),
            IoctlArg::Buffer(buf) => RecordedArg::Buffer(buf.to_vec()),
        };
        self.calls.push(Call {
            code: request,
            number,
            arg: recorded,
        });

        let Some(reply) = self.replies.get_mut(&number).and_then(|q| q.pop_front()) else {
            return Ok(0);
        };
        if let (Some(fill), IoctlArg::Buffer(buf)) = (reply.fill, arg) {
            let n = fill.len().min(buf.len());
            buf[..n].copy_from_slice(&fill[..n]);
        }
        reply.ret
    }
}

/// Event frame as the driver writes it
pub fn event_frame(kind: u32, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + data.len());
    frame.extend_from_slice(&kind.to_le_bytes());
    frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
    frame.extend_from_slice(data);
    frame
}
