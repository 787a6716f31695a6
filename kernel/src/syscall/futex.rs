//! Futexes
//!
//! Wait queues keyed by the *physical* address of the futex word, so
//! shared mappings work across processes. `wait` parks the calling
//! thread unless the word changed under it; `wake` moves up to `count`
//! waiters back to Ready.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::{collections::BTreeMap, vec::Vec};

use core::ptr::NonNull;

use spin::Mutex;

use super::process::current_user_map;
use super::SyscallResult;
use crate::error::Errno;
use crate::mm::{usercopy, VirtAddr};
use crate::process::thread::{self, Thread, ThreadState};

struct WaitQueues {
    queues: BTreeMap<u64, Vec<NonNull<Thread>>>,
}

// SAFETY: thread pointers are only touched under the queue lock and stay
// live while parked (a parked thread cannot exit).
unsafe impl Send for WaitQueues {}

static FUTEXES: Mutex<WaitQueues> = Mutex::new(WaitQueues {
    queues: BTreeMap::new(),
});

pub fn sys_futex_wait(
    uaddr: usize,
    expected: usize,
    _timeout_ptr: usize,
    _: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    let result = (|| {
        let map = current_user_map()?;
        let mut raw = [0u8; 4];
        usercopy::copy_from_user(&map, VirtAddr::new(uaddr as u64), &mut raw)?;
        if u32::from_ne_bytes(raw) != expected as u32 {
            return Err(Errno::EAGAIN);
        }

        let key = map
            .translate(VirtAddr::new(uaddr as u64))
            .ok_or(Errno::EFAULT)?
            .as_u64();
        let mut thread_ptr = thread::current().ok_or(Errno::ESRCH)?;
        {
            let mut futexes = FUTEXES.lock();
            futexes.queues.entry(key).or_default().push(thread_ptr);
            // SAFETY: this CPU owns its current thread.
            unsafe { thread_ptr.as_mut().state = ThreadState::Waiting };
        }
        crate::sched::invoke();
        Ok(0)
    })();
    result.into()
}

pub fn sys_futex_wake(
    uaddr: usize,
    count: usize,
    _: usize,
    _: usize,
    _: usize,
    _: usize,
) -> SyscallResult {
    let result = (|| {
        let map = current_user_map()?;
        let key = map
            .translate(VirtAddr::new(uaddr as u64))
            .ok_or(Errno::EFAULT)?
            .as_u64();

        let woken = {
            let mut futexes = FUTEXES.lock();
            let Some(queue) = futexes.queues.get_mut(&key) else {
                return Ok(0);
            };
            let take = count.min(queue.len());
            let woken: Vec<NonNull<Thread>> = queue.drain(..take).collect();
            if queue.is_empty() {
                futexes.queues.remove(&key);
            }
            woken
        };

        let woken_count = woken.len();
        for waiter in woken {
            crate::sched::wake_thread(waiter);
        }
        Ok(woken_count)
    })();
    result.into()
}
