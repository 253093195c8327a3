use alloc::vec::Vec;

use crate::error::KernelError;
use crate::fs::Path;
use crate::log;
use crate::memlayout::{TRAMPOLINE, TRAPFRAME};
use crate::param::{MAXARG, USERSTACK};
use crate::proc::CPU_POOL;
use crate::riscv::{PGSIZE, PTE_R, PTE_W, PTE_X, pg_round_up};
use crate::trampoline::trampoline;
use crate::vm::{PA, Uvm, VA};

const ELF_MAGIC: u32 = 0x464C457F; // "\x7fELF"
const ELF_PROG_LOAD: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ElfHeader {
    magic: u32,
    ident: [u8; 12],
    r#type: u16,
    machine: u16,
    version: u32,
    entry: u64,
    phoff: u64,
    shoff: u64,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

impl ElfHeader {
    const SIZE: usize = size_of::<Self>();

    fn from_bytes(bytes: &[u8]) -> Self {
        unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Self) }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ProgramHeader {
    r#type: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

impl ProgramHeader {
    const SIZE: usize = size_of::<Self>();

    fn from_bytes(bytes: &[u8]) -> Self {
        unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Self) }
    }

    fn perms(&self) -> usize {
        let mut perm = 0;
        if self.flags & 0x1 != 0 {
            perm |= PTE_X;
        }
        if self.flags & 0x2 != 0 {
            perm |= PTE_W;
        }
        perm
    }
}

/// Builds an empty user page table with only the trampoline and trapframe mapped, mirroring
/// [`crate::proc`]'s own `proc_pagetable` since a fresh address space is needed here too, before
/// the running process's old one is torn down.
fn bare_pagetable(trapframe_pa: PA) -> Result<Uvm, KernelError> {
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

/// Returns the final path component, e.g. `"a"` for `"/bin/a"`, used as the process name.
fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Replaces the calling process's memory image with the ELF binary at `path`, following the
/// classic xv6 three-phase protocol: validate and load into a brand new page table, build the
/// argument stack, then only commit (swap the page table in, drop the old one) once nothing can
/// fail anymore. Any error before the commit point leaves the caller's current image untouched.
///
/// Returns the new `sp` (stashed in `a0` by the caller so `sys_exec` never actually "returns" to
/// its own trapframe) on success.
pub fn exec(path: &Path, argv: &[&str]) -> Result<usize, KernelError> {
    let proc = CPU_POOL.current_proc().ok_or(KernelError::NoProc)?;
    let mut size = 0usize;

    log::begin_op();

    let inode = path.resolve().inspect_err(|_| log::end_op())?;
    let mut inner = inode.lock();

    let mut hdr_buf = [0u8; ElfHeader::SIZE];
    if inode.read(&mut inner, 0, &mut hdr_buf, false) != Ok(ElfHeader::SIZE as u32) {
        inode.unlock_put(inner);
        log::end_op();
        return Err(KernelError::BadExec);
    }

    let elf = ElfHeader::from_bytes(&hdr_buf);
    if elf.magic != ELF_MAGIC {
        inode.unlock_put(inner);
        log::end_op();
        return Err(KernelError::BadExec);
    }

    let data = unsafe { proc.data_mut() };
    let trapframe_pa = PA(data.trapframe.as_ref().unwrap().as_ref() as *const _ as usize);

    let mut pagetable = match bare_pagetable(trapframe_pa) {
        Ok(pt) => pt,
        Err(e) => {
            inode.unlock_put(inner);
            log::end_op();
            return Err(e);
        }
    };

    let result = 'build: {
        let mut ph_buf = [0u8; ProgramHeader::SIZE];
        let mut off = elf.phoff;

        for _ in 0..elf.phnum {
            if inode.read(&mut inner, off as u32, &mut ph_buf, false)
                != Ok(ProgramHeader::SIZE as u32)
            {
                break 'build Err(KernelError::BadExec);
            }

            let ph = ProgramHeader::from_bytes(&ph_buf);
            off += ProgramHeader::SIZE as u64;

            if ph.r#type != ELF_PROG_LOAD {
                continue;
            }

            if ph.memsz < ph.filesz
                || ph.vaddr.checked_add(ph.memsz).is_none()
                || !ph.vaddr.is_multiple_of(PGSIZE as u64)
            {
                break 'build Err(KernelError::BadExec);
            }

            size = match pagetable.alloc(size, (ph.vaddr + ph.memsz) as usize, ph.perms()) {
                Ok(new_size) => new_size,
                Err(e) => break 'build Err(e),
            };

            if load_segment(
                &mut pagetable,
                &inode,
                &mut inner,
                VA(ph.vaddr as usize),
                ph.offset as u32,
                ph.filesz as usize,
            )
            .is_err()
            {
                break 'build Err(KernelError::BadExec);
            }
        }

        Ok(size)
    };

    inode.unlock_put(inner);
    log::end_op();

    size = match result {
        Ok(size) => size,
        Err(e) => {
            pagetable.proc_free(size);
            return Err(e);
        }
    };

    size = pg_round_up(size);
    let stack_top = size + (USERSTACK + 1) * PGSIZE;

    size = match pagetable.alloc(size, stack_top, PTE_W) {
        Ok(new_size) => new_size,
        Err(e) => {
            pagetable.proc_free(size);
            return Err(e);
        }
    };

    // the lowest stack page is a guard: mapped and backed, but not user-accessible, so a
    // stack overflow faults instead of corrupting whatever is below it.
    if pagetable.clear(VA(size - (USERSTACK + 1) * PGSIZE)).is_err() {
        pagetable.proc_free(size);
        return Err(KernelError::BadExec);
    }

    let mut sp = size;
    let stack_base = sp - USERSTACK * PGSIZE;

    let mut ustack = [0u64; MAXARG + 1];
    if argv.len() > MAXARG {
        pagetable.proc_free(size);
        return Err(KernelError::BadExec);
    }

    for (i, arg) in argv.iter().enumerate() {
        sp -= arg.len() + 1;
        sp -= sp % 16;

        if sp < stack_base {
            pagetable.proc_free(size);
            return Err(KernelError::BadExec);
        }

        if pagetable.copy_out(VA(sp), arg.as_bytes()).is_err()
            || pagetable.copy_out(VA(sp + arg.len()), &[0u8]).is_err()
        {
            pagetable.proc_free(size);
            return Err(KernelError::BadExec);
        }

        ustack[i] = sp as u64;
    }

    let argc = argv.len();
    ustack[argc] = 0;

    sp -= (argc + 1) * size_of::<u64>();
    sp -= sp % 16;

    if sp < stack_base {
        pagetable.proc_free(size);
        return Err(KernelError::BadExec);
    }

    let ustack_bytes: Vec<u8> = ustack[..=argc]
        .iter()
        .flat_map(|p| p.to_ne_bytes())
        .collect();

    if pagetable.copy_out(VA(sp), &ustack_bytes).is_err() {
        pagetable.proc_free(size);
        return Err(KernelError::BadExec);
    }

    // commit: from here on nothing can fail, so swap in the new image.
    let name = basename(path.as_str());
    let old_pagetable = data.pagetable.replace(pagetable);
    let old_size = data.size;
    data.size = size;
    data.name.clear();
    data.name.push_str(name);

    let trapframe = data.trapframe.as_mut().unwrap();
    trapframe.epc = elf.entry as usize;
    trapframe.sp = sp;
    trapframe.a0 = argc; // argc, read by Args::from_stack on entry
    trapframe.a1 = sp; // argv pointer array

    if let Some(old) = old_pagetable {
        old.proc_free(old_size);
    }

    Ok(sp)
}

/// Copies `filesz` bytes starting at file `offset` into the page table's mapping at `va`, one
/// page at a time so a freshly allocated range never needs more than a page of kernel buffer.
fn load_segment(
    pagetable: &mut Uvm,
    inode: &crate::fs::Inode,
    inner: &mut crate::sleeplock::SleepLockGuard<'_, crate::fs::InodeInner>,
    va: VA,
    offset: u32,
    filesz: usize,
) -> Result<(), KernelError> {
    let mut i = 0;

    while i < filesz {
        let n = (filesz - i).min(PGSIZE);
        let mut buf = [0u8; PGSIZE];

        if inode.read(inner, offset + i as u32, &mut buf[..n], false) != Ok(n as u32) {
            return Err(KernelError::Fs);
        }

        pagetable
            .copy_out(va + i, &buf[..n])
            .map_err(|_| KernelError::Fs)?;

        i += n;
    }

    Ok(())
}

