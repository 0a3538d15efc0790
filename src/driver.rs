use std::arch::naked_asm;
use std::sync::{Arc, Mutex};

use anyhow::{bail, ensure, Result};

use crate::{Assembly, Op, Runtime};

bitflags::bitflags! {
    /// Protection bits applied to a code mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Protection: i32 {
        const READ = libc::PROT_READ;
        const WRITE = libc::PROT_WRITE;
        const EXEC = libc::PROT_EXEC;
    }
}

/// An anonymous executable mapping holding the native code of one compiled function.
///
/// The region is unmapped when the page is dropped, so pages must outlive any possible return
/// into their code; the driver keeps every page alive until it is dropped itself.
#[derive(Debug)]
pub struct CodePage {
    region: *mut u8,
    len: usize,
}

// The raw region pointer keeps `CodePage` from being `Send` automatically; the page itself is
// plain memory owned by this value.
unsafe impl Send for CodePage {}

impl CodePage {
    /// Maps one read/write/execute page and copies `code` into it.
    fn new(code: &[u8]) -> Result<Self> {
        let len = page_size();
        ensure!(
            code.len() <= len,
            "compiled function is {} bytes, larger than one {} byte page",
            code.len(),
            len,
        );

        // SAFETY: an anonymous private mapping with no requested address has no preconditions.
        let region = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                (Protection::READ | Protection::WRITE | Protection::EXEC).bits(),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if region == libc::MAP_FAILED {
            bail!("mmap failed: {}", std::io::Error::last_os_error());
        }
        let region = region.cast::<u8>();

        // SAFETY: the mapping is at least `code.len()` bytes and nothing else aliases it yet.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), region, code.len());
        }

        Ok(Self { region, len })
    }

    /// Absolute address of the first instruction.
    fn addr(&self) -> usize {
        self.region as usize
    }
}

impl Drop for CodePage {
    fn drop(&mut self) {
        // SAFETY: `region`/`len` came from a successful mmap and are unmapped exactly once.
        unsafe {
            libc::munmap(self.region.cast(), self.len);
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// Compiles parsed functions on demand and owns the resulting code pages.
#[derive(Debug)]
pub struct JitDriver {
    functions: Vec<Vec<Op>>,
    pages: Vec<Option<CodePage>>,
    runtime: Arc<Runtime>,
}

impl JitDriver {
    pub fn new(functions: Vec<Vec<Op>>, runtime: Arc<Runtime>) -> Self {
        let pages = std::iter::repeat_with(|| None).take(functions.len()).collect();
        Self {
            functions,
            pages,
            runtime,
        }
    }

    /// The entry point: the last function in the program.
    pub fn main_id(&self) -> u32 {
        (self.functions.len() - 1) as u32
    }

    pub fn runtime(&self) -> Arc<Runtime> {
        self.runtime.clone()
    }

    /// Compiles function `id` and rewrites its table slot to point at the new code.
    ///
    /// Requesting an id that was never parsed is a programmer error and panics.
    pub fn compile(&mut self, id: u32) -> Result<()> {
        let body = &self.functions[id as usize];

        let mut code = Assembly::new();
        for op in body {
            op.emit(&self.runtime, &mut code);
        }
        code.emit_bytes(&[0xC3]); // ret

        #[cfg(feature = "logging")]
        eprintln!("compiled function {id} ({} bytes): {:02x?}", code.len(), code.bytes());

        let page = CodePage::new(code.bytes())?;
        self.runtime.install(id, page.addr());
        self.pages[id as usize] = Some(page);

        Ok(())
    }
}

/// The driver consulted by [`compile_and_enter`].
///
/// The trampoline has to be a free function of fixed address, so it cannot carry a receiver;
/// this handle is the bootstrap wire that makes the driver reachable from it. Written once at
/// startup, cleared at program end.
static DRIVER: Mutex<Option<JitDriver>> = Mutex::new(None);

/// Installs the process-wide driver. Must happen before [`Runtime::start`] is first called.
pub fn install_driver(driver: JitDriver) {
    *DRIVER.lock().expect("driver lock poisoned") = Some(driver);
}

/// Drops the process-wide driver, unmapping every code page.
pub fn clear_driver() {
    *DRIVER.lock().expect("driver lock poisoned") = None;
}

/// The trampoline found in every function-table slot before compilation.
///
/// Compiles the requested function (rewriting its table slot) and then re-enters through the
/// table, so the compiled code runs as if the caller had reached it directly; when it returns,
/// the caller's `call` continues one instruction past where it left off. Each lazy compile costs
/// an extra host stack frame.
///
/// Generated bodies keep `rsp` where they found it but push no frame of their own, so at odd
/// call depths this entry is reached with `rsp` off the 16-byte alignment the System V ABI
/// promises compiled code. The shim realigns before entering Rust and undoes it on the way out;
/// `rdi` carries the id straight through.
#[unsafe(naked)]
pub extern "C" fn compile_and_enter(id: u32) {
    naked_asm!(
        "push rbp",
        "mov rbp, rsp",
        "and rsp, -16",
        "call {enter}",
        "mov rsp, rbp",
        "pop rbp",
        "ret",
        enter = sym compile_then_start,
    )
}

/// Compiles function `id`, then enters it through the now-rewritten table slot.
///
/// Compilation failures have no error channel back through JITted frames, so they print a
/// diagnostic and exit the process.
extern "C" fn compile_then_start(id: u32) {
    let runtime = {
        let mut slot = DRIVER.lock().expect("driver lock poisoned");
        let driver = slot.as_mut().expect("no jit driver installed");
        if let Err(err) = driver.compile(id) {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
        driver.runtime()
    };
    // The lock is released before re-entering generated code; a nested call into a
    // not-yet-compiled function re-takes it.
    runtime.start(id);
}
