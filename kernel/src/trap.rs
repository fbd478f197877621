//! 陷入分发。
//!
//! 所有陷入桩把现场压成 `TrapFrame` 后进到这里。系统调用、
//! 缺页和时钟都在当前线程的内核栈上处理，可以在处理中途调度。

use crate::{arch, processor};
use kernel_context::TrapFrame;
use kernel_vm::{FaultError, FaultKind};
use syscall::{Caller, SyscallId, SyscallResult};

const PF_WRITE: u32 = 1 << 1;
/// 缺页时段错误的退出码，128 + SIGSEGV。
const SEGV_EXIT: isize = 128 + 11;

/// 陷入入口，符号由陷入桩引用。
#[no_mangle]
extern "C" fn trap_handler(tf: &mut TrapFrame) {
    match tf.vec {
        14 => page_fault(tf),
        0x80 => syscall(tf),
        32 => {
            arch::pic::eoi(0);
            processor::on_tick();
        }
        vec => {
            if tf.from_user() {
                log::warn!(
                    "user exception {} err {:#x} at {:#x}, killing thread",
                    vec,
                    tf.err,
                    tf.eip,
                );
                processor::exit_thread(SEGV_EXIT);
            }
            panic!("unexpected trap {} at {:#x}", vec, tf.eip);
        }
    }
}

/// 缺页：让所在地址空间解决；解决不了就结束这个线程，
/// 进程的其他线程不受影响。内核自己缺页是致命错误。
fn page_fault(tf: &mut TrapFrame) {
    let addr = arch::cpu::read_cr2();
    let kind = if tf.err & PF_WRITE != 0 {
        FaultKind::Write
    } else {
        FaultKind::Read
    };
    if !tf.from_user() {
        panic!(
            "kernel page fault at {:#x} (access {:?}, eip {:#x})",
            addr, kind, tf.eip
        );
    }

    let resolved = processor::PROCESSOR.exclusive_session(|p| {
        let space = p
            .get_current_proc()
            .and_then(|proc| proc.space.as_mut())
            .ok_or(FaultError::NoRegion)?;
        space.handle_page_fault(addr, kind)
    });
    if let Err(reason) = resolved {
        log::warn!(
            "segmentation fault at {:#x} ({:?}, {:?}, eip {:#x})",
            addr,
            kind,
            reason,
            tf.eip,
        );
        processor::exit_thread(SEGV_EXIT);
    }
}

/// 系统调用：eax 是调用号，ebx..edi 是参数，返回值写回 eax。
fn syscall(tf: &mut TrapFrame) {
    let id = SyscallId::from(tf.eax as usize);
    let args = [tf.arg(0), tf.arg(1), tf.arg(2), tf.arg(3), tf.arg(4)];
    let caller = processor::PROCESSOR.exclusive_session(|p| Caller {
        entity: p.current_proc_id().map_or(0, |pid| pid.get_usize()),
        flow: p.current_id().map_or(0, |tid| tid.get_usize()),
    });
    match syscall::handle(caller, id, args) {
        SyscallResult::Done(ret) => tf.eax = ret as u32,
        SyscallResult::Unsupported(id) => {
            log::warn!("unsupported syscall {:?}", id);
            tf.eax = (-syscall::errno::ENOSYS) as u32;
        }
    }
}
