use std::fmt;

use crate::{Assembly, Runtime};

// 3-bit register codes used in ModRM and SIB bytes.
const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RSP: u8 = 4;
const RSI: u8 = 6;
const RDI: u8 = 7;

/// REX prefix selecting 64-bit operand size.
const REX_W: u8 = 0x48;

// ModRM addressing modes.
const INDIRECT: u8 = 0b00;
const DIRECT: u8 = 0b11;

/// `rm` value selecting a SIB byte in indirect mode.
const USE_SIB: u8 = 0b100;
/// SIB index value meaning "no index register".
const NO_INDEX: u8 = 0b100;

// SIB scale factors.
const SCALE_1: u8 = 0b00;
const SCALE_4: u8 = 0b10;
const SCALE_8: u8 = 0b11;

/// The ModRM operand byte: addressing mode plus two register selectors.
///
/// In direct-mode instructions with an immediate, `reg` is the opcode extension instead.
#[bitfield_struct::bitfield(u8)]
struct ModRm {
    #[bits(3)]
    rm: u8,
    #[bits(3)]
    reg: u8,
    #[bits(2)]
    mode: u8,
}

/// The SIB byte: scale factor, index register, and base register.
#[bitfield_struct::bitfield(u8)]
struct Sib {
    #[bits(3)]
    base: u8,
    #[bits(3)]
    index: u8,
    #[bits(2)]
    scale: u8,
}

fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    ModRm::new().with_mode(mode).with_reg(reg).with_rm(rm).into()
}

fn sib(scale: u8, index: u8, base: u8) -> u8 {
    Sib::new().with_scale(scale).with_index(index).with_base(base).into()
}

/// A single primitive operation of the tape language.
///
/// Each variant emits a self-contained x86_64 sequence that is position-independent with respect
/// to the other primitives; the only addresses baked in are the runtime's three fixed locations,
/// so assembled function bodies need no relocation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Move the tape cursor by a signed amount.
    Move(i32),
    /// Add a signed amount to the current cell.
    UpdateCell(i32),
    /// Write the current cell's low byte to stdout, followed by a newline.
    Output,
    /// Read one byte from stdin into the current cell.
    Input,
    /// Call the function whose id is stored in the current cell.
    Invoke,
}

impl Op {
    /// Appends this primitive's machine code to `code`.
    ///
    /// Emitted sequences use only `rax`/`rbx`/`rcx`/`rdx`/`rsi`/`rdi` as scratch and leave `rsp`
    /// as they found it. Only `Invoke` emits a `call`.
    pub fn emit(&self, runtime: &Runtime, code: &mut Assembly) {
        match *self {
            Op::Move(amount) => emit_move(runtime, code, amount),
            Op::UpdateCell(amount) => emit_update_cell(runtime, code, amount),
            Op::Output => emit_output(runtime, code),
            Op::Input => emit_input(runtime, code),
            Op::Invoke => emit_invoke(runtime, code),
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Op::Move(amount) => write!(f, ">({amount})"),
            Op::UpdateCell(amount) => write!(f, "+({amount})"),
            Op::Output => write!(f, "."),
            Op::Input => write!(f, ","),
            Op::Invoke => write!(f, "@"),
        }
    }
}

/// Loads the tape index into `rax` and points `rbx` at the tape base.
///
/// The current cell is `[rbx + rax*4]` afterwards.
fn emit_cell_address(runtime: &Runtime, code: &mut Assembly) {
    // movabs rbx, <tape index address>
    code.emit_bytes(&[REX_W, 0xBB]);
    code.emit_bytes(&runtime.tape_index_addr());
    // mov rax, [rbx]
    code.emit_bytes(&[REX_W, 0x8B, modrm(INDIRECT, RAX, RBX)]);
    // movabs rbx, <tape base address>
    code.emit_bytes(&[REX_W, 0xBB]);
    code.emit_bytes(&runtime.tape_addr());
}

fn emit_move(runtime: &Runtime, code: &mut Assembly, amount: i32) {
    // movabs rbx, <tape index address>
    code.emit_bytes(&[REX_W, 0xBB]);
    code.emit_bytes(&runtime.tape_index_addr());
    // mov rax, [rbx]
    code.emit_bytes(&[REX_W, 0x8B, modrm(INDIRECT, RAX, RBX)]);
    // add rax, <amount>
    code.emit_bytes(&[REX_W, 0x05]);
    code.emit_bytes(&amount.to_le_bytes());
    // mov [rbx], rax
    code.emit_bytes(&[REX_W, 0x89, modrm(INDIRECT, RAX, RBX)]);
}

fn emit_update_cell(runtime: &Runtime, code: &mut Assembly, amount: i32) {
    emit_cell_address(runtime, code);
    // Cells are 32 bits wide; the load, add, and store all stay at 32 bits so the neighbouring
    // cell is untouched.
    // mov ecx, [rbx + rax*4]
    code.emit_bytes(&[0x8B, modrm(INDIRECT, RCX, USE_SIB), sib(SCALE_4, RAX, RBX)]);
    // add ecx, <amount>
    code.emit_bytes(&[0x81, modrm(DIRECT, 0, RCX)]);
    code.emit_bytes(&amount.to_le_bytes());
    // mov [rbx + rax*4], ecx
    code.emit_bytes(&[0x89, modrm(INDIRECT, RCX, USE_SIB), sib(SCALE_4, RAX, RBX)]);
}

fn emit_output(runtime: &Runtime, code: &mut Assembly) {
    emit_cell_address(runtime, code);
    // mov ecx, [rbx + rax*4]
    code.emit_bytes(&[0x8B, modrm(INDIRECT, RCX, USE_SIB), sib(SCALE_4, RAX, RBX)]);
    // push 0x00000A00; the newline at [rsp + 1] forces line-buffered terminals to flush
    code.emit_bytes(&[0x68, 0x00, 0x0A, 0x00, 0x00]);
    // mov BYTE PTR [rsp], cl
    code.emit_bytes(&[0x88, modrm(INDIRECT, RCX, USE_SIB), sib(SCALE_1, NO_INDEX, RSP)]);
    // mov rax, 1 (write)
    code.emit_bytes(&[REX_W, 0xC7, modrm(DIRECT, 0, RAX), 0x01, 0x00, 0x00, 0x00]);
    // mov edi, 1 (stdout)
    code.emit_bytes(&[0xBF, 0x01, 0x00, 0x00, 0x00]);
    // mov rsi, rsp
    code.emit_bytes(&[REX_W, 0x89, modrm(DIRECT, RSP, RSI)]);
    // mov rdx, 2 (the cell byte plus the newline)
    code.emit_bytes(&[REX_W, 0xC7, modrm(DIRECT, 0, RDX), 0x02, 0x00, 0x00, 0x00]);
    // syscall
    code.emit_bytes(&[0x0F, 0x05]);
    // add rsp, 8
    code.emit_bytes(&[REX_W, 0x83, modrm(DIRECT, 0, RSP), 0x08]);
}

fn emit_input(runtime: &Runtime, code: &mut Assembly) {
    // mov rax, 0 (read)
    code.emit_bytes(&[REX_W, 0xC7, modrm(DIRECT, 0, RAX), 0x00, 0x00, 0x00, 0x00]);
    // sub rsp, 1 (one-byte buffer)
    code.emit_bytes(&[REX_W, 0x83, modrm(DIRECT, 5, RSP), 0x01]);
    // mov rdi, 0 (stdin)
    code.emit_bytes(&[REX_W, 0xC7, modrm(DIRECT, 0, RDI), 0x00, 0x00, 0x00, 0x00]);
    // lea rsi, [rsp]
    code.emit_bytes(&[REX_W, 0x8D, modrm(INDIRECT, RSI, USE_SIB), sib(SCALE_1, NO_INDEX, RSP)]);
    // mov rdx, 1
    code.emit_bytes(&[REX_W, 0xC7, modrm(DIRECT, 0, RDX), 0x01, 0x00, 0x00, 0x00]);
    // syscall
    code.emit_bytes(&[0x0F, 0x05]);
    // movabs rbx, <tape index address>
    code.emit_bytes(&[REX_W, 0xBB]);
    code.emit_bytes(&runtime.tape_index_addr());
    // mov rcx, [rbx]; the read byte will land in rax, so the index lives in rcx here
    code.emit_bytes(&[REX_W, 0x8B, modrm(INDIRECT, RCX, RBX)]);
    // movzx rax, BYTE PTR [rsp]
    code.emit_bytes(&[REX_W, 0x0F, 0xB6, modrm(INDIRECT, RAX, USE_SIB), sib(SCALE_1, NO_INDEX, RSP)]);
    // movabs rbx, <tape base address>
    code.emit_bytes(&[REX_W, 0xBB]);
    code.emit_bytes(&runtime.tape_addr());
    // mov [rbx + rcx*4], eax (32-bit store, matching the cell width)
    code.emit_bytes(&[0x89, modrm(INDIRECT, RAX, USE_SIB), sib(SCALE_4, RCX, RBX)]);
    // add rsp, 1
    code.emit_bytes(&[REX_W, 0x83, modrm(DIRECT, 0, RSP), 0x01]);
}

fn emit_invoke(runtime: &Runtime, code: &mut Assembly) {
    emit_cell_address(runtime, code);
    // mov ecx, [rbx + rax*4] (the current cell holds the callee's function id)
    code.emit_bytes(&[0x8B, modrm(INDIRECT, RCX, USE_SIB), sib(SCALE_4, RAX, RBX)]);
    // movabs rax, <function table address>
    code.emit_bytes(&[REX_W, 0xB8]);
    code.emit_bytes(&runtime.function_table_addr());
    // mov rbx, [rax + rcx*8] (table entries are 8 bytes wide)
    code.emit_bytes(&[REX_W, 0x8B, modrm(INDIRECT, RBX, USE_SIB), sib(SCALE_8, RCX, RAX)]);
    // mov rdi, rcx (first argument: the function id)
    code.emit_bytes(&[REX_W, 0x89, modrm(DIRECT, RCX, RDI)]);
    // call rbx
    code.emit_bytes(&[0xFF, modrm(DIRECT, 2, RBX)]);
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn nop(_id: u32) {}

    fn emitted(op: Op, runtime: &Runtime) -> Vec<u8> {
        let mut code = Assembly::new();
        op.emit(runtime, &mut code);
        code.bytes().to_vec()
    }

    #[test]
    fn move_bakes_index_address_and_delta() {
        let runtime = Runtime::new(nop);

        let mut expected = vec![0x48, 0xBB];
        expected.extend_from_slice(&runtime.tape_index_addr());
        expected.extend_from_slice(&[0x48, 0x8B, 0x03]); // mov rax, [rbx]
        expected.extend_from_slice(&[0x48, 0x05]); // add rax, imm32
        expected.extend_from_slice(&(-7i32).to_le_bytes());
        expected.extend_from_slice(&[0x48, 0x89, 0x03]); // mov [rbx], rax

        assert_eq!(emitted(Op::Move(-7), &runtime), expected);
    }

    #[test]
    fn update_cell_uses_32_bit_accesses() {
        let runtime = Runtime::new(nop);

        let mut expected = vec![0x48, 0xBB];
        expected.extend_from_slice(&runtime.tape_index_addr());
        expected.extend_from_slice(&[0x48, 0x8B, 0x03]); // mov rax, [rbx]
        expected.extend_from_slice(&[0x48, 0xBB]);
        expected.extend_from_slice(&runtime.tape_addr());
        expected.extend_from_slice(&[0x8B, 0x0C, 0x83]); // mov ecx, [rbx + rax*4]
        expected.extend_from_slice(&[0x81, 0xC1]); // add ecx, imm32
        expected.extend_from_slice(&5i32.to_le_bytes());
        expected.extend_from_slice(&[0x89, 0x0C, 0x83]); // mov [rbx + rax*4], ecx

        assert_eq!(emitted(Op::UpdateCell(5), &runtime), expected);
    }

    #[test]
    fn output_writes_cell_byte_then_newline() {
        let runtime = Runtime::new(nop);

        let mut expected = vec![0x48, 0xBB];
        expected.extend_from_slice(&runtime.tape_index_addr());
        expected.extend_from_slice(&[0x48, 0x8B, 0x03]); // mov rax, [rbx]
        expected.extend_from_slice(&[0x48, 0xBB]);
        expected.extend_from_slice(&runtime.tape_addr());
        expected.extend_from_slice(&[0x8B, 0x0C, 0x83]); // mov ecx, [rbx + rax*4]
        expected.extend_from_slice(&[0x68, 0x00, 0x0A, 0x00, 0x00]); // push 0x00000A00
        expected.extend_from_slice(&[0x88, 0x0C, 0x24]); // mov [rsp], cl
        expected.extend_from_slice(&[0x48, 0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00]); // mov rax, 1
        expected.extend_from_slice(&[0xBF, 0x01, 0x00, 0x00, 0x00]); // mov edi, 1
        expected.extend_from_slice(&[0x48, 0x89, 0xE6]); // mov rsi, rsp
        expected.extend_from_slice(&[0x48, 0xC7, 0xC2, 0x02, 0x00, 0x00, 0x00]); // mov rdx, 2
        expected.extend_from_slice(&[0x0F, 0x05]); // syscall
        expected.extend_from_slice(&[0x48, 0x83, 0xC4, 0x08]); // add rsp, 8

        assert_eq!(emitted(Op::Output, &runtime), expected);
    }

    #[test]
    fn input_stores_through_rcx_index() {
        let runtime = Runtime::new(nop);

        let mut expected = vec![0x48, 0xC7, 0xC0, 0x00, 0x00, 0x00, 0x00]; // mov rax, 0
        expected.extend_from_slice(&[0x48, 0x83, 0xEC, 0x01]); // sub rsp, 1
        expected.extend_from_slice(&[0x48, 0xC7, 0xC7, 0x00, 0x00, 0x00, 0x00]); // mov rdi, 0
        expected.extend_from_slice(&[0x48, 0x8D, 0x34, 0x24]); // lea rsi, [rsp]
        expected.extend_from_slice(&[0x48, 0xC7, 0xC2, 0x01, 0x00, 0x00, 0x00]); // mov rdx, 1
        expected.extend_from_slice(&[0x0F, 0x05]); // syscall
        expected.extend_from_slice(&[0x48, 0xBB]);
        expected.extend_from_slice(&runtime.tape_index_addr());
        expected.extend_from_slice(&[0x48, 0x8B, 0x0B]); // mov rcx, [rbx]
        expected.extend_from_slice(&[0x48, 0x0F, 0xB6, 0x04, 0x24]); // movzx rax, BYTE [rsp]
        expected.extend_from_slice(&[0x48, 0xBB]);
        expected.extend_from_slice(&runtime.tape_addr());
        expected.extend_from_slice(&[0x89, 0x04, 0x8B]); // mov [rbx + rcx*4], eax
        expected.extend_from_slice(&[0x48, 0x83, 0xC4, 0x01]); // add rsp, 1

        assert_eq!(emitted(Op::Input, &runtime), expected);
    }

    #[test]
    fn invoke_dispatches_through_the_table() {
        let runtime = Runtime::new(nop);

        let mut expected = vec![0x48, 0xBB];
        expected.extend_from_slice(&runtime.tape_index_addr());
        expected.extend_from_slice(&[0x48, 0x8B, 0x03]); // mov rax, [rbx]
        expected.extend_from_slice(&[0x48, 0xBB]);
        expected.extend_from_slice(&runtime.tape_addr());
        expected.extend_from_slice(&[0x8B, 0x0C, 0x83]); // mov ecx, [rbx + rax*4]
        expected.extend_from_slice(&[0x48, 0xB8]); // movabs rax, <table>
        expected.extend_from_slice(&runtime.function_table_addr());
        expected.extend_from_slice(&[0x48, 0x8B, 0x1C, 0xC8]); // mov rbx, [rax + rcx*8]
        expected.extend_from_slice(&[0x48, 0x89, 0xCF]); // mov rdi, rcx
        expected.extend_from_slice(&[0xFF, 0xD3]); // call rbx

        assert_eq!(emitted(Op::Invoke, &runtime), expected);
    }

    #[test]
    fn display_matches_source_notation() {
        assert_eq!(Op::Move(4).to_string(), ">(4)");
        assert_eq!(Op::UpdateCell(-2).to_string(), "+(-2)");
        assert_eq!(Op::Output.to_string(), ".");
        assert_eq!(Op::Input.to_string(), ",");
        assert_eq!(Op::Invoke.to_string(), "@");
    }
}
