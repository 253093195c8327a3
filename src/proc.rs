use alloc::boxed::Box;
use alloc::string::String;
use core::cell::UnsafeCell;
use core::mem::{MaybeUninit, transmute};
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::KernelError;
use crate::file::File;
use crate::fs::{Inode, ROOTINO};
use crate::log;
use crate::memlayout::{self, TRAMPOLINE, TRAPFRAME};
use crate::param::{NCPU, NOFILE, NPROC, ROOTDEV};
use crate::println;
use crate::riscv::interrupts;
use crate::riscv::registers::tp;
use crate::riscv::{PGSIZE, PTE_R, PTE_W, PTE_X};
use crate::spinlock::{SpinLock, SpinLockGuard};
use crate::swtch::swtch;
use crate::trampoline::trampoline;
use crate::vm::{self, PA, Uvm, VA};

pub static CPU_POOL: Cpus = Cpus::new();

pub struct Cpus([UnsafeCell<Cpu>; NCPU]);
unsafe impl Sync for Cpus {}

pub struct Cpu {
    pub proc: Option<&'static Proc>,
    pub context: Context,
    pub num_off: isize,
    pub interrupt_enabled: bool,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            proc: None,
            context: Context::new(),
            num_off: 0,
            interrupt_enabled: false,
        }
    }

    fn lock(&mut self, old_state: bool) -> InterruptLock {
        if self.num_off == 0 {
            self.interrupt_enabled = old_state;
        }
        self.num_off += 1;
        InterruptLock {}
    }

    fn unlock(&mut self) {
        assert!(!interrupts::get(), "cpu unlock - interruptible");
        assert!(self.num_off >= 1, "cpu unlock");

        self.num_off -= 1;
        if self.num_off == 0 && self.interrupt_enabled {
            interrupts::enable();
        }
    }
}

impl Cpus {
    const fn new() -> Self {
        let mut array: [MaybeUninit<_>; NCPU] = unsafe { MaybeUninit::uninit().assume_init() };
        let mut i = 0;
        while i < NCPU {
            array[i] = MaybeUninit::new(UnsafeCell::new(Cpu::new()));
            i += 1;
        }
        unsafe { transmute(array) }
    }

    /// Return the hart id of this CPU.
    ///
    /// # Safety: must be called with interrupts disabled,
    /// to prevent race with process being moved to a different CPU.
    #[inline]
    pub unsafe fn get_id() -> usize {
        tp::read()
    }

    /// Returns a mutable pointer to this CPU's [`Cpu`] struct.
    ///
    /// # Safety: must be called with interrupts disabled,
    /// to prevent race with process being moved to a different CPU.
    pub unsafe fn mycpu() -> *mut Cpu {
        assert!(!interrupts::get(), "mycpu interrupts enabled");
        let id = Self::get_id();
        CPU_POOL.0[id].get()
    }

    /// Locks this CPU by disabling interrupts.
    /// Returns an [`InterruptLock`] as the ownership and lifetime of the lock.
    pub fn lock_mycpu() -> InterruptLock {
        let old_state = interrupts::get();
        interrupts::disable();

        unsafe { (*Self::mycpu()).lock(old_state) }
    }

    /// Same as [`Self::get_id`], exposed as a method for callers holding a `Cpus` reference.
    ///
    /// # Safety
    /// Same requirement as [`Self::get_id`]: interrupts must already be disabled.
    pub unsafe fn current_id(&self) -> usize {
        unsafe { Self::get_id() }
    }

    /// Same as [`Self::lock_mycpu`], exposed as a method.
    pub fn lock_current(&self) -> InterruptLock {
        Self::lock_mycpu()
    }

    /// Returns the process currently running on this CPU, if any.
    pub fn current_proc(&self) -> Option<&'static Proc> {
        let _lock = Self::lock_mycpu();
        unsafe { (*Self::mycpu()).proc }
    }

    /// Records the process currently running on this CPU. Only the scheduler calls this.
    fn set_current_proc(&self, proc: Option<&'static Proc>) {
        let _lock = Self::lock_mycpu();
        unsafe { (*Self::mycpu()).proc = proc };
    }
}

pub struct InterruptLock {}

impl Drop for InterruptLock {
    fn drop(&mut self) {
        unsafe { (*Cpus::mycpu()).unlock() }
    }
}

/// Saved registers for kernel context switches.
#[repr(C)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,

    // callee-saved
    pub s0: usize,
    pub s1: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

// per-process data for the trap handling code in trampoline.S.
// sits in a page by itself just under the trampoline page in the
// user page table. not specially mapped in the kernel page table.
// uservec in trampoline.S saves user registers in the trapframe,
// then initializes registers from the trapframe's
// kernel_sp, kernel_hartid, kernel_satp, and jumps to kernel_trap.
// usertrapret() and userret in trampoline.S set up
// the trapframe's kernel_*, restore user registers from the
// trapframe, switch to the user page table, and enter user space.
// the trapframe includes callee-saved user registers like s0-s11 because the
// return-to-user path via usertrapret() doesn't return through
// the entire kernel call stack.
#[repr(C, align(4096))]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    /*   0 */ pub kernel_satp: usize, // kernel page table
    /*   8 */ pub kernel_sp: usize, // top of process's kernel stack
    /*  16 */ pub kernel_trap: usize, // usertrap()
    /*  24 */ pub epc: usize, // saved user program counter
    /*  32 */ pub kernel_hartid: usize, // saved kernel tp
    /*  40 */ pub ra: usize,
    /*  48 */ pub sp: usize,
    /*  56 */ pub gp: usize,
    /*  64 */ pub tp: usize,
    /*  72 */ pub t0: usize,
    /*  80 */ pub t1: usize,
    /*  88 */ pub t2: usize,
    /*  96 */ pub s0: usize,
    /* 104 */ pub s1: usize,
    /* 112 */ pub a0: usize,
    /* 120 */ pub a1: usize,
    /* 128 */ pub a2: usize,
    /* 136 */ pub a3: usize,
    /* 144 */ pub a4: usize,
    /* 152 */ pub a5: usize,
    /* 160 */ pub a6: usize,
    /* 168 */ pub a7: usize,
    /* 176 */ pub s2: usize,
    /* 184 */ pub s3: usize,
    /* 192 */ pub s4: usize,
    /* 200 */ pub s5: usize,
    /* 208 */ pub s6: usize,
    /* 216 */ pub s7: usize,
    /* 224 */ pub s8: usize,
    /* 232 */ pub s9: usize,
    /* 240 */ pub s10: usize,
    /* 248 */ pub s11: usize,
    /* 256 */ pub t3: usize,
    /* 264 */ pub t4: usize,
    /* 272 */ pub t5: usize,
    /* 280 */ pub t6: usize,
}

impl TrapFrame {
    const fn zeroed() -> Self {
        Self {
            kernel_satp: 0,
            kernel_sp: 0,
            kernel_trap: 0,
            epc: 0,
            kernel_hartid: 0,
            ra: 0,
            sp: 0,
            gp: 0,
            tp: 0,
            t0: 0,
            t1: 0,
            t2: 0,
            s0: 0,
            s1: 0,
            a0: 0,
            a1: 0,
            a2: 0,
            a3: 0,
            a4: 0,
            a5: 0,
            a6: 0,
            a7: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
            t3: 0,
            t4: 0,
            t5: 0,
            t6: 0,
        }
    }
}

/// Process ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PID(usize);

impl PID {
    const fn zero() -> Self {
        PID(0)
    }

    fn next() -> Self {
        static NEXT_PID: AtomicUsize = AtomicUsize::new(1);
        PID(NEXT_PID.fetch_add(1, Ordering::Relaxed))
    }
}

impl From<usize> for PID {
    fn from(value: usize) -> Self {
        PID(value)
    }
}

impl Deref for PID {
    type Target = usize;

    fn deref(&self) -> &usize {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

/// What a sleeping process is waiting on. Takes the place of xv6's untyped `void *chan`: the
/// address of whatever's being waited for still disambiguates distinct wait conditions, but the
/// variant documents which kind of condition it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Ticks,
    Log,
    Lock(usize),
    Buffer(usize),
    Addr(usize),
    Wait(usize),
    PipeRead(usize),
    PipeWrite(usize),
}

/// A user-space pointer a syscall argument was tagged as. Currently there is only one kind of
/// process address space to resolve against, but the wrapper keeps `fs.rs`'s block layer from
/// depending on `vm::VA` meaning "this process's user space" implicitly.
#[derive(Debug, Clone, Copy)]
pub enum Addr {
    User(VA),
}

/// Per-process `sigalarm`/`sigreturn` state.
#[derive(Debug, Clone)]
pub struct AlarmState {
    pub interval: usize,
    pub handler: usize,
    pub ticks_since_last: usize,
    pub in_handler: bool,
    pub saved_trapframe: TrapFrame,
}

impl AlarmState {
    pub fn new(interval: usize, handler: usize) -> Self {
        Self {
            interval,
            handler,
            ticks_since_last: 0,
            in_handler: false,
            saved_trapframe: TrapFrame::zeroed(),
        }
    }
}

// Per-process state
pub struct Proc {
    pub inner: SpinLock<ProcInner>,
    data: UnsafeCell<ProcData>,
}

// Safety: `data` is only ever aliased by the kernel thread that owns this process (the one
// currently running it, or setting it up before it is first scheduled).
unsafe impl Sync for Proc {}

// lock must be held when using these
pub struct ProcInner {
    pub state: ProcState,
    pub chan: Option<Channel>,
    pub killed: bool,
    pub xstate: i32,
    pub pid: PID,
    pub parent: Option<&'static Proc>,
}

impl ProcInner {
    const fn new() -> Self {
        Self {
            state: ProcState::Unused,
            chan: None,
            killed: false,
            xstate: 0,
            pid: PID::zero(),
            parent: None,
        }
    }
}

// private to the owning process; inner's lock need not be held to touch these
pub struct ProcData {
    pub kstack: VA,
    pub size: usize,
    pub pagetable: Option<Uvm>,
    pub trapframe: Option<Box<TrapFrame>>,
    pub context: Context,
    pub open_files: [Option<File>; NOFILE],
    pub cwd: Inode,
    pub name: String,
    pub alarm: Option<AlarmState>,
}

impl ProcData {
    const fn new() -> Self {
        Self {
            kstack: VA(0),
            size: 0,
            pagetable: None,
            trapframe: None,
            context: Context::new(),
            open_files: [const { None }; NOFILE],
            cwd: Inode::new(0, 0, 0),
            name: String::new(),
            alarm: None,
        }
    }
}

impl Proc {
    const fn new() -> Self {
        Self {
            inner: SpinLock::new(ProcInner::new(), "proc"),
            data: UnsafeCell::new(ProcData::new()),
        }
    }

    /// Read-only view of this process's private data. Like xv6's unlocked reads of `p->pid`,
    /// `p->name`, etc., this is only safe to use for fields nothing else is concurrently mutating.
    pub fn data(&self) -> &ProcData {
        unsafe { &*self.data.get() }
    }

    /// # Safety
    /// Caller must not create this alongside another live `&ProcData`/`&mut ProcData` borrow of
    /// the same process. In practice only the kernel thread currently running (or setting up)
    /// this process touches it.
    pub unsafe fn data_mut(&self) -> &mut ProcData {
        unsafe { &mut *self.data.get() }
    }

    pub fn is_killed(&self) -> bool {
        self.inner.lock().killed
    }
}

pub static PROCS: ProcTable = ProcTable::new();

pub struct ProcTable([Proc; NPROC]);

impl ProcTable {
    const fn new() -> Self {
        Self([const { Proc::new() }; NPROC])
    }

    /// Allocates one kernel-stack page per process and maps it into the kernel page table below
    /// the trampoline, each separated from its neighbor by an unmapped guard page.
    ///
    /// # Safety
    /// Must run exactly once, while building the kernel page table (`Kvm::make`), before any
    /// process is scheduled.
    pub(crate) unsafe fn map_stacks(&self) {
        for (i, p) in self.0.iter().enumerate() {
            let stack: Box<[u8; PGSIZE]> = Box::new([0; PGSIZE]);
            let pa = PA(Box::into_raw(stack) as *mut u8 as usize);
            let va = VA(memlayout::kstack(i));

            unsafe {
                vm::KVM
                    .get_mut()
                    .expect("kvm to be init")
                    .map(va, pa, PGSIZE, PTE_R | PTE_W);

                (*p.data.get()).kstack = va;
            }
        }
    }
}

impl Deref for ProcTable {
    type Target = [Proc; NPROC];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Holds the first process, so children of exiting processes have somewhere to be reparented to.
static INIT_PROC: SpinLock<Option<&'static Proc>> = SpinLock::new(None, "init_proc");

/// Guards `ProcInner::parent` and the exit/wait rendezvous. Must be acquired before any `p.inner`
/// it protects alongside, never after, matching xv6's `wait_lock` ordering.
static WAIT_LOCK: SpinLock<()> = SpinLock::new((), "wait_lock");

/// A user program that calls `exec("/init")`, assembled from the classic xv6 `initcode.S`. There
/// is no file system yet when the first process is built, so its image is baked in here instead
/// of being loaded by `exec`.
#[rustfmt::skip]
const INITCODE: [u8; 52] = [
    0x17, 0x05, 0x00, 0x00, 0x13, 0x05, 0x45, 0x02,
    0x97, 0x05, 0x00, 0x00, 0x93, 0x85, 0x35, 0x02,
    0x93, 0x08, 0x70, 0x00, 0x73, 0x00, 0x00, 0x00,
    0x93, 0x08, 0x20, 0x00, 0x73, 0x00, 0x00, 0x00,
    0xef, 0xf0, 0x9f, 0xff, 0x2f, 0x69, 0x6e, 0x69,
    0x74, 0x00, 0x00, 0x24, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00,
];

/// Initializes the process table. Kernel stacks are mapped as a side effect of building the
/// kernel page table (`Kvm::make` calls `PROCS.map_stacks()`), so there is no further work here.
pub fn init() {
    println!("proc init");
}

/// Looks through the process table for an `Unused` slot, marks it `Used`, and allocates the
/// trapframe and empty page table every process needs. Returns with nothing locked.
fn alloc_proc() -> Result<&'static Proc, KernelError> {
    for p in PROCS.iter() {
        let mut inner = p.inner.lock();

        if inner.state != ProcState::Unused {
            continue;
        }

        inner.pid = PID::next();
        inner.state = ProcState::Used;
        drop(inner);

        let data = unsafe { p.data_mut() };

        let trapframe = Box::new(TrapFrame::zeroed());
        let trapframe_pa = PA(trapframe.as_ref() as *const TrapFrame as usize);
        data.trapframe = Some(trapframe);

        data.pagetable = match proc_pagetable(trapframe_pa) {
            Ok(pagetable) => Some(pagetable),
            Err(err) => {
                free_proc(p);
                return Err(err);
            }
        };

        data.context = Context::new();
        data.context.ra = forkret as usize;
        data.context.sp = (data.kstack + PGSIZE).as_usize();

        return Ok(p);
    }

    Err(KernelError::NoProc)
}

/// Frees a process structure and everything hanging off it, including its user memory. Leaves the
/// slot `Unused` for `alloc_proc` to reuse.
fn free_proc(p: &'static Proc) {
    let data = unsafe { p.data_mut() };

    data.trapframe = None;

    if let Some(pagetable) = data.pagetable.take() {
        pagetable.proc_free(data.size);
    }

    data.size = 0;
    data.name = String::new();
    data.alarm = None;
    data.cwd = Inode::new(0, 0, 0);

    let mut inner = p.inner.lock();
    inner.pid = PID::zero();
    inner.parent = None;
    inner.chan = None;
    inner.killed = false;
    inner.xstate = 0;
    inner.state = ProcState::Unused;
}

/// Creates a user page table for a brand new process, with no user memory but with the
/// trampoline and trapframe mapped (every process needs both to take and return from traps).
fn proc_pagetable(trapframe_pa: PA) -> Result<Uvm, KernelError> {
    let mut pagetable = Uvm::try_new()?;

    if pagetable
        .map_pages(
            VA(TRAMPOLINE),
            PA(trampoline as *const () as usize),
            PGSIZE,
            PTE_R | PTE_X,
        )
        .is_err()
    {
        pagetable.free(0);
        return Err(KernelError::AllocError);
    }

    if pagetable
        .map_pages(VA(TRAPFRAME), trapframe_pa, PGSIZE, PTE_R | PTE_W)
        .is_err()
    {
        pagetable.unmap(VA(TRAMPOLINE), 1, false);
        pagetable.free(0);
        return Err(KernelError::AllocError);
    }

    Ok(pagetable)
}

/// Set up the first user process.
pub fn user_init() {
    let p = alloc_proc().expect("user_init: out of processes");
    *INIT_PROC.lock() = Some(p);

    let data = unsafe { p.data_mut() };

    data.pagetable
        .as_mut()
        .expect("user_init: no pagetable")
        .first(&INITCODE)
        .expect("user_init: uvmfirst");
    data.size = PGSIZE;

    // prepare for the very first return from kernel to user.
    let trapframe = data.trapframe.as_mut().expect("user_init: no trapframe");
    trapframe.epc = 0;
    trapframe.sp = PGSIZE;

    data.name = String::from("initcode");

    // `Inode::get` only does in-memory bookkeeping; the actual disk read is deferred to the first
    // `.lock()` on the inode, by which point `forkret` has already run `fs::init`.
    data.cwd = Inode::get(ROOTDEV, ROOTINO).expect("user_init: root inode");

    p.inner.lock().state = ProcState::Runnable;
}

/// A fork child's very first scheduling by `scheduler` swtch'es to this, since it has never
/// called `sched` and so has nothing else to resume into.
extern "C" fn forkret() -> ! {
    static FIRST: AtomicBool = AtomicBool::new(true);

    if FIRST.swap(false, Ordering::AcqRel) {
        // File system initialization must run in the context of a regular process, since it
        // calls sleep(), and so cannot run from main().
        crate::fs::init(ROOTDEV);
        crate::file::setup_console_fds();
    }

    unsafe { crate::trap::usertrapret() };
    unreachable!("usertrapret does not return");
}

/// Per-hart scheduler: picks a `Runnable` process, swtch'es into it, and repeats once swtch
/// returns here (the process yielded, slept, or exited).
pub fn scheduler() -> ! {
    let cpu_context: *mut Context = unsafe { &mut (*Cpus::mycpu()).context };

    loop {
        interrupts::enable();

        for p in PROCS.iter() {
            let mut inner = p.inner.lock();

            if inner.state != ProcState::Runnable {
                continue;
            }

            inner.state = ProcState::Running;
            CPU_POOL.set_current_proc(Some(p));

            let proc_context: *mut Context = unsafe { &mut p.data_mut().context };

            // `inner` is carried across the switch (see `sched`) and only dropped once `p` has
            // actually swtch'ed back to us, so no other hart can ever observe `p` as `Runnable`
            // while it is mid-switch.
            inner = unsafe { sched(inner, cpu_context, proc_context) };
            drop(inner);

            CPU_POOL.set_current_proc(None);
        }
    }
}

/// Switches away from whichever side calls it (scheduler or process), carrying the process's own
/// lock across the raw context switch so it stays held for the CPU's entire time away from this
/// stack. Returns the same guard once control switches back here.
///
/// The caller must have already recorded the process's new state (not `Running`, when called from
/// the process side). `from`/`to` follow `swtch`'s own argument order: context to save into, then
/// context to load.
unsafe fn sched<'a>(
    proc_inner: SpinLockGuard<'a, ProcInner>,
    from: *mut Context,
    to: *mut Context,
) -> SpinLockGuard<'a, ProcInner> {
    unsafe { swtch(from, to) };
    proc_inner
}

/// Gives up the CPU for one scheduling round.
pub fn r#yield() {
    let proc = CPU_POOL.current_proc().expect("yield: no current proc");

    let mut inner = proc.inner.lock();
    inner.state = ProcState::Runnable;

    let cpu_context: *mut Context = unsafe { &mut (*Cpus::mycpu()).context };
    let proc_context: *mut Context = unsafe { &mut proc.data_mut().context };

    drop(unsafe { sched(inner, proc_context, cpu_context) });
}

/// Passes a parentless process's children to `init`, waking `init` if it is in `wait()`.
fn reparent(proc: &'static Proc) {
    let init = *INIT_PROC.lock();

    for p in PROCS.iter() {
        let mut inner = p.inner.lock();

        if inner.parent.is_some_and(|parent| core::ptr::eq(parent, proc)) {
            inner.parent = init;
            drop(inner);

            if let Some(init) = init {
                wakeup(Channel::Wait(init as *const Proc as usize));
            }
        }
    }
}

/// Terminates the current process. Does not return.
pub fn exit(status: i32) -> ! {
    let proc = CPU_POOL.current_proc().expect("exit: no current proc");

    {
        let data = unsafe { proc.data_mut() };

        for file in data.open_files.iter_mut() {
            if let Some(mut f) = file.take() {
                f.close();
            }
        }

        log::begin_op();
        let cwd = core::mem::replace(&mut data.cwd, Inode::new(0, 0, 0));
        cwd.put();
        log::end_op();
    }

    reparent(proc);

    let wait_lock = WAIT_LOCK.lock();

    let parent = proc.inner.lock().parent;
    if let Some(parent) = parent {
        wakeup(Channel::Wait(parent as *const Proc as usize));
    }

    let mut inner = proc.inner.lock();
    inner.xstate = status;
    inner.state = ProcState::Zombie;
    drop(wait_lock);

    let cpu_context: *mut Context = unsafe { &mut (*Cpus::mycpu()).context };
    let proc_context: *mut Context = unsafe { &mut proc.data_mut().context };
    unsafe { sched(inner, proc_context, cpu_context) };
    unreachable!("exit: a zombie cannot be rescheduled");
}

/// Creates a new process, copying the parent's memory and open files. Returns the child's PID.
pub fn fork() -> Result<PID, KernelError> {
    let proc = CPU_POOL.current_proc().ok_or(KernelError::NoProc)?;
    let pdata = unsafe { proc.data_mut() };

    let child = alloc_proc()?;
    let cdata = unsafe { child.data_mut() };

    if pdata
        .pagetable
        .as_mut()
        .expect("fork: no pagetable")
        .copy_cow(cdata.pagetable.as_mut().expect("fork: no child pagetable"), pdata.size)
        .is_err()
    {
        free_proc(child);
        return Err(KernelError::AllocError);
    }

    cdata.size = pdata.size;

    **cdata.trapframe.as_mut().expect("fork: no trapframe") =
        **pdata.trapframe.as_ref().expect("fork: no parent trapframe");
    // the child's fork() returns 0
    cdata.trapframe.as_mut().unwrap().a0 = 0;

    for i in 0..NOFILE {
        if let Some(file) = pdata.open_files[i].as_mut() {
            cdata.open_files[i] = Some(file.dup());
        }
    }

    cdata.cwd = pdata.cwd.dup();
    cdata.name = pdata.name.clone();

    {
        let _wait_lock = WAIT_LOCK.lock();
        child.inner.lock().parent = Some(proc);
    }

    let mut inner = child.inner.lock();
    let pid = inner.pid;
    inner.state = ProcState::Runnable;

    Ok(pid)
}

/// Waits for a child to exit, reaps it, and writes its exit status to `addr` (a user pointer; a
/// null address skips the write). Returns the reaped child's PID, or `None` if the caller has no
/// children or was killed while waiting.
pub fn wait(addr: VA) -> Option<PID> {
    let proc = CPU_POOL.current_proc().expect("wait: no current proc");
    let mut guard = WAIT_LOCK.lock();

    loop {
        let mut have_children = false;

        for p in PROCS.iter() {
            let is_child = p
                .inner
                .lock()
                .parent
                .is_some_and(|parent| core::ptr::eq(parent, proc));

            if !is_child {
                continue;
            }

            have_children = true;
            let mut inner = p.inner.lock();

            if inner.state == ProcState::Zombie {
                let pid = inner.pid;
                let xstate = inner.xstate;
                inner.parent = None;
                drop(inner);

                free_proc(p);

                if addr.0 != 0 && copy_out_user(&xstate.to_ne_bytes(), addr).is_err() {
                    return None;
                }

                return Some(pid);
            }
        }

        if !have_children || proc.is_killed() {
            return None;
        }

        guard = sleep(Channel::Wait(proc as *const Proc as usize), guard);
    }
}

/// Grows or shrinks the current process's memory by `n` bytes.
///
/// # Safety
/// Must be called from a syscall context with a current process.
pub unsafe fn grow(n: isize) -> Result<(), KernelError> {
    let proc = CPU_POOL.current_proc().ok_or(KernelError::NoProc)?;
    let data = unsafe { proc.data_mut() };
    let pagetable = data.pagetable.as_mut().ok_or(KernelError::NoProc)?;

    let old_size = data.size;
    let new_size = old_size.checked_add_signed(n).ok_or(KernelError::InvalidAddress)?;

    let size = if n > 0 {
        pagetable.alloc(old_size, new_size, PTE_W)?
    } else {
        pagetable.dealloc(old_size, new_size)
    };

    data.size = size;
    Ok(())
}

/// Marks the process with the given PID killed, waking it up if it is sleeping so it can notice.
/// Returns 0 on success, 1 if no such process exists.
pub fn kill(pid: PID) -> u8 {
    for p in PROCS.iter() {
        let mut inner = p.inner.lock();

        if inner.pid == pid {
            inner.killed = true;

            if inner.state == ProcState::Sleeping {
                inner.state = ProcState::Runnable;
            }

            return 0;
        }
    }

    1
}

/// Puts the current process to sleep on `chan`, releasing `guard` first and reacquiring an
/// equivalent guard on the same lock before returning.
pub fn sleep<'a, T>(chan: Channel, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
    let proc = CPU_POOL.current_proc().expect("sleep: no current proc");
    let lock = guard.spinlock();

    // Acquire our own lock before releasing the condition lock, so a concurrent `wakeup` can
    // never run between the two and be missed.
    let mut inner = proc.inner.lock();
    drop(guard);

    inner.chan = Some(chan);
    inner.state = ProcState::Sleeping;

    let cpu_context: *mut Context = unsafe { &mut (*Cpus::mycpu()).context };
    let proc_context: *mut Context = unsafe { &mut proc.data_mut().context };
    inner = unsafe { sched(inner, proc_context, cpu_context) };

    inner.chan = None;
    drop(inner);

    lock.lock()
}

/// Wakes every process sleeping on `chan`, except the caller (waking oneself makes no sense).
pub fn wakeup(chan: Channel) {
    let current = CPU_POOL.current_proc();

    for p in PROCS.iter() {
        if let Some(current) = current
            && core::ptr::eq(p, current)
        {
            continue;
        }

        let mut inner = p.inner.lock();
        if inner.state == ProcState::Sleeping && inner.chan == Some(chan) {
            inner.state = ProcState::Runnable;
        }
    }
}

/// Copies from a kernel buffer to a user address in the current process.
pub fn copy_out_user(src: &[u8], dstva: VA) -> Result<(), KernelError> {
    let proc = CPU_POOL.current_proc().ok_or(KernelError::NoProc)?;
    let data = unsafe { proc.data_mut() };
    let pagetable = data.pagetable.as_mut().ok_or(KernelError::NoProc)?;
    pagetable.copy_out(dstva, src)
}

/// Copies from a user address in the current process into a kernel buffer.
pub fn copy_in_user(dst: &mut [u8], srcva: VA) -> Result<(), KernelError> {
    let proc = CPU_POOL.current_proc().ok_or(KernelError::NoProc)?;
    let data = unsafe { proc.data_mut() };
    let pagetable = data.pagetable.as_mut().ok_or(KernelError::NoProc)?;
    pagetable.copy_in(dst, srcva)
}

/// Copies from a kernel buffer to `dst`, resolving whatever address space `dst` names.
pub fn copy_out(src: &[u8], dst: Addr) -> Result<(), KernelError> {
    match dst {
        Addr::User(va) => copy_out_user(src, va),
    }
}

/// Copies from `src` into a kernel buffer, resolving whatever address space `src` names.
pub fn copy_in(src: Addr, dst: &mut [u8]) -> Result<(), KernelError> {
    match src {
        Addr::User(va) => copy_in_user(dst, va),
    }
}
