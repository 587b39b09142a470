//! The context switch itself.
//!
//! `thread_yield` saves the outgoing thread's callee-saved registers,
//! return address and flags into its [`ThreadContext`], publishes the
//! outgoing thread's new state, then falls through into `thread_invoke`
//! which loads the incoming context and jumps. The incoming thread resumes
//! as if its own `thread_yield` call had just returned (or, on first run,
//! enters the spawn trampoline with its argument in `rdi`).

use core::arch::global_asm;

use super::thread::ThreadContext;

global_asm!(
    r#"
.global thread_yield
.global thread_invoke

// thread_yield(old_ctx: *mut ThreadContext,   // rdi
//              old_state: *mut u64,           // rsi
//              new_ctx: *const ThreadContext, // rdx
//              new_state_of_old: u64)         // rcx
thread_yield:
    mov [rdi + 0x00], rbx
    mov [rdi + 0x08], rbp
    lea rax, [rsp + 8]          // rsp as it will be once we have returned
    mov [rdi + 0x10], rax
    mov [rdi + 0x18], r12
    mov [rdi + 0x20], r13
    mov [rdi + 0x28], r14
    mov [rdi + 0x30], r15
    mov [rdi + 0x38], rdi
    mov rax, [rsp]              // resume point: our return address
    mov [rdi + 0x40], rax
    pushfq
    pop rax
    mov [rdi + 0x48], rax

    mov [rsi], rcx              // outgoing thread is now Idle or Blocked

    mov rdi, rdx
    // fall through

// thread_invoke(new_ctx: *const ThreadContext) -> !
thread_invoke:
    mov rbx, [rdi + 0x00]
    mov rbp, [rdi + 0x08]
    mov rsp, [rdi + 0x10]
    mov r12, [rdi + 0x18]
    mov r13, [rdi + 0x20]
    mov r14, [rdi + 0x28]
    mov r15, [rdi + 0x30]
    mov rax, [rdi + 0x48]
    push rax
    popfq
    mov rax, [rdi + 0x40]       // rip
    mov rdi, [rdi + 0x38]       // trampoline argument on first entry
    jmp rax
"#
);

extern "C" {
    /// Switch from the context at `old_ctx` to the one at `new_ctx`,
    /// storing `new_state_of_old` into `old_state` after the save.
    pub fn thread_yield(
        old_ctx: *mut ThreadContext,
        old_state: *mut u64,
        new_ctx: *const ThreadContext,
        new_state_of_old: u64,
    );

    /// Enter `new_ctx` without saving anything. Used for the first switch
    /// on a CPU and when retiring an exiting thread.
    pub fn thread_invoke(new_ctx: *const ThreadContext) -> !;
}
