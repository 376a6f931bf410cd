//! Worker process main loop.
//!
//! Runs inside the forked child. Reads framed requests from the parent,
//! runs the task for each one, and writes framed replies back.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::{Pid, getppid};

use super::frame::Channel;
use super::protocol::{self, PayloadResult, Reply, TaskFailure};
use super::signals;
use super::task::Task;

/// Pause between write attempts while a reply is queued.
const FLUSH_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Settings the child needs from its parent.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChildSettings {
    /// Process to notify on completion and exit.
    pub parent: Pid,
    /// Whether to raise SIGUSR1/SIGUSR2 at the parent.
    pub notify_parent: bool,
    /// Sleep between empty reads.
    pub poll_interval: Duration,
}

/// Run one payload through the task, turning errors and panics into failures.
pub(crate) fn handle_request<T: Task>(task: &mut T, body: &[u8]) -> Reply<T::Output> {
    let payload: T::Payload = match protocol::decode_payload(body) {
        Ok(payload) => payload,
        Err(e) => return Reply::error(format!("Invalid request: {}", e)),
    };

    let result: PayloadResult<T::Output> =
        match panic::catch_unwind(AssertUnwindSafe(|| task.run(payload))) {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(TaskFailure::new(format!("{:#}", e))),
            Err(panic) => Err(TaskFailure::new(panic_message(panic.as_ref()))),
        };
    Reply::from(result)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    format!("task panicked: {}", detail)
}

fn encode_reply<O: serde::Serialize>(reply: &Reply<O>) -> Vec<u8> {
    match reply.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            // The output itself could not be encoded; report that instead
            let fallback: Reply<O> = Reply::error(format!("Unencodable result: {}", e));
            fallback.to_bytes().unwrap_or_default()
        }
    }
}

/// Write a reply frame out completely.
///
/// Inbound bytes keep being buffered meanwhile, so a parent still writing a
/// large payload is never waiting on a child that is waiting on it.
/// `on_stall` runs once if the socket fills up before the reply is out.
fn deliver(channel: &mut Channel, body: &[u8], mut on_stall: impl FnMut()) -> io::Result<()> {
    channel.send(body)?;
    let mut stalled = false;
    while !channel.flush()? {
        if !stalled {
            on_stall();
            stalled = true;
        }
        channel.fill_inbound()?;
        std::thread::sleep(FLUSH_RETRY_DELAY);
    }
    Ok(())
}

/// Worker main loop. Returns the process exit code.
///
/// Handling is strictly sequential: the next request is only read after the
/// previous reply has been written.
pub(crate) fn run<T: Task>(task: &mut T, mut channel: Channel, settings: ChildSettings) -> i32 {
    signals::init_child();

    if channel.set_nonblocking(true).is_err() {
        return 1;
    }

    let mut code = 0;
    while !signals::termination_requested() {
        let body = match channel.try_recv() {
            Ok(Some(body)) => body,
            Ok(None) if channel.is_closed() => break, // Parent went away
            Ok(None) if getppid() != settings.parent => break, // Orphaned
            Ok(None) => {
                std::thread::sleep(settings.poll_interval);
                continue;
            }
            Err(_) => {
                code = 1;
                break;
            }
        };

        let reply = handle_request(task, &body);
        // A stalled reply also raises SIGUSR1 so the parent starts reading
        let notify = || {
            if settings.notify_parent {
                let _ = signal::kill(settings.parent, Signal::SIGUSR1);
            }
        };
        if deliver(&mut channel, &encode_reply(&reply), notify).is_err() {
            code = 1;
            break;
        }

        if settings.notify_parent {
            let _ = signal::kill(settings.parent, Signal::SIGUSR1);
        }
    }

    drop(channel);
    if settings.notify_parent {
        let _ = signal::kill(settings.parent, Signal::SIGUSR2);
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::task::task_fn;

    #[test]
    fn test_handle_request_result() {
        let mut task = task_fn(|x: i64| Ok(x * 2));
        let body = protocol::encode_payload(&21i64).unwrap();
        let reply = handle_request(&mut task, &body);
        assert_eq!(reply.into_result(), Ok(42));
    }

    #[test]
    fn test_handle_request_task_error() {
        let mut task = task_fn(|_: i64| -> anyhow::Result<i64> { anyhow::bail!("bad input") });
        let body = protocol::encode_payload(&1i64).unwrap();
        let reply = handle_request(&mut task, &body);
        assert_eq!(reply.into_result(), Err(TaskFailure::new("bad input")));
    }

    #[test]
    fn test_handle_request_invalid_payload() {
        let mut task = task_fn(|x: i64| Ok(x));
        let reply = handle_request(&mut task, b"\"not a number\"");
        let failure = reply.into_result().unwrap_err();
        assert!(failure.message.starts_with("Invalid request"));
    }

    #[test]
    fn test_handle_request_panic_becomes_failure() {
        let mut task = task_fn(|x: i64| -> anyhow::Result<i64> {
            if x < 0 {
                panic!("negative input");
            }
            Ok(x)
        });
        let body = protocol::encode_payload(&-1i64).unwrap();
        let failure = handle_request(&mut task, &body).into_result().unwrap_err();
        assert!(failure.message.contains("negative input"));
    }

    #[test]
    fn test_deliver_reads_while_writing() {
        let (mut parent, mut child) = Channel::pair().unwrap();
        parent.set_nonblocking(true).unwrap();
        child.set_nonblocking(true).unwrap();

        // Both sides queue more than the socket holds before either reads
        let payload = vec![1u8; 1024 * 1024];
        parent.send(&payload).unwrap();
        assert!(parent.has_pending_output());

        let reader = std::thread::spawn(move || {
            let reply = loop {
                match parent.try_recv().unwrap() {
                    Some(frame) => break frame,
                    None => std::thread::sleep(Duration::from_millis(1)),
                }
            };
            while !parent.flush().unwrap() {
                std::thread::sleep(Duration::from_millis(1));
            }
            (reply, parent)
        });

        let mut stalls = 0;
        deliver(&mut child, &vec![2u8; 1024 * 1024], || stalls += 1).unwrap();
        assert_eq!(stalls, 1);

        // The payload written meanwhile arrives intact
        let received = loop {
            match child.try_recv().unwrap() {
                Some(frame) => break frame,
                None => std::thread::sleep(Duration::from_millis(1)),
            }
        };
        assert_eq!(received, payload);

        let (reply, _parent) = reader.join().unwrap();
        assert_eq!(reply, vec![2u8; 1024 * 1024]);
    }

    #[test]
    fn test_panic_message_variants() {
        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "task panicked: owned");
        let other: Box<dyn std::any::Any + Send> = Box::new(5u8);
        assert!(panic_message(other.as_ref()).contains("unknown"));
    }
}
