//! Runtime prelude of the emitted program.
//!
//! A fixed set of hand-written assembly routines is emitted before user
//! functions: linear-memory access, the Linux syscall shims, the terminal
//! mode helpers, and the `coatl_start` entry point. `__coatl_init_memory`
//! is generated per program from the string interning table.
use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::{
    asm::{Instruction, InstructionOperand, InstructionSize, Reg},
    parser::Type,
};

use super::strings::StringTable;

/// Parameter and return types of the runtime intrinsics, used by call
/// classification in the backend.
pub(super) static INTRINSIC_SIGS: Lazy<HashMap<&'static str, (Vec<Type>, Type)>> =
    Lazy::new(|| {
        use Type::*;
        HashMap::from([
            ("__mem_load", (vec![I32], I32)),
            ("__mem_load8", (vec![I32], I32)),
            ("__mem_store", (vec![I32, I32], I32)),
            ("__mem_store8", (vec![I32, I32], I32)),
            ("__fd_write", (vec![I32, I32, I32, I32], I32)),
            ("__fd_read", (vec![I32, I32, I32, I32], I32)),
            ("__fd_close", (vec![I32], I32)),
            (
                "__path_open",
                (vec![I32, I32, I32, I32, I32, I64, I64, I32, I32], I32),
            ),
            ("__tty_get_mode", (vec![I32], I32)),
            ("__tty_set_raw", (vec![I32, I32, I32], I32)),
            ("__tty_restore", (vec![I32], I32)),
        ])
    });

/// `__mem_load(addr)` / `__mem_load8(addr)` / `__mem_store(addr, val)` /
/// `__mem_store8(addr, val)` — dword and byte access into `__coatl_mem`.
const MEM_ACCESS: &str = "
__mem_load:
\tlea\tr11, __coatl_mem[rip]
\tmov\teax, edi
\tmov\teax, DWORD PTR [r11+rax]
\tret

__mem_load8:
\tlea\tr11, __coatl_mem[rip]
\tmov\teax, edi
\tmovzx\teax, BYTE PTR [r11+rax]
\tret

__mem_store:
\tlea\tr11, __coatl_mem[rip]
\tmov\teax, edi
\tmov\tDWORD PTR [r11+rax], esi
\txor\teax, eax
\tret

__mem_store8:
\tlea\tr11, __coatl_mem[rip]
\tmov\teax, edi
\tmov\tBYTE PTR [r11+rax], sil
\txor\teax, eax
\tret
";

/// `__fd_write(fd, iov_base, iov_cnt, nwritten_out)` — one `write` syscall
/// per iovec entry; returns 0 or -errno.
const FD_WRITE: &str = "
__fd_write:
\tpush\trbp
\tmov\trbp, rsp
\tpush\trbx
\tpush\tr12
\tpush\tr13
\tpush\tr14
\tpush\tr15
\tmov\tr12d, edi
\tmov\tr13d, esi
\tmov\tr14d, edx
\tmov\tr15d, ecx
\txor\tebx, ebx
\tlea\tr10, __coatl_mem[rip]
.Lfd_write_loop:
\ttest\tr14d, r14d
\tjle\t.Lfd_write_done
\tmov\teax, r13d
\tmov\tesi, DWORD PTR [r10+rax]
\tmov\tedx, DWORD PTR [r10+rax+4]
\tlea\trsi, [r10+rsi]
\tmov\tedi, r12d
\tmov\teax, 1
\tsyscall
\ttest\trax, rax
\tjs\t.Lfd_write_ret
\tadd\tebx, eax
\tadd\tr13d, 8
\tsub\tr14d, 1
\tjmp\t.Lfd_write_loop
.Lfd_write_done:
\tmov\teax, r15d
\tmov\tDWORD PTR [r10+rax], ebx
\txor\teax, eax
.Lfd_write_ret:
\tpop\tr15
\tpop\tr14
\tpop\tr13
\tpop\tr12
\tpop\trbx
\tpop\trbp
\tret
";

/// `__fd_read(fd, iov_base, iov_cnt, nread_out)` — symmetric with `read`;
/// a short read terminates the loop.
const FD_READ: &str = "
__fd_read:
\tpush\trbp
\tmov\trbp, rsp
\tpush\trbx
\tpush\tr12
\tpush\tr13
\tpush\tr14
\tpush\tr15
\tmov\tr12d, edi
\tmov\tr13d, esi
\tmov\tr14d, edx
\tmov\tr15d, ecx
\txor\tebx, ebx
\tlea\tr10, __coatl_mem[rip]
.Lfd_read_loop:
\ttest\tr14d, r14d
\tjle\t.Lfd_read_done
\tmov\teax, r13d
\tmov\tesi, DWORD PTR [r10+rax]
\tmov\tedx, DWORD PTR [r10+rax+4]
\tlea\trsi, [r10+rsi]
\tmov\tedi, r12d
\txor\teax, eax
\tsyscall
\ttest\trax, rax
\tjs\t.Lfd_read_ret
\tadd\tebx, eax
\tcmp\teax, edx
\tjl\t.Lfd_read_done
\tadd\tr13d, 8
\tsub\tr14d, 1
\tjmp\t.Lfd_read_loop
.Lfd_read_done:
\tmov\teax, r15d
\tmov\tDWORD PTR [r10+rax], ebx
\txor\teax, eax
.Lfd_read_ret:
\tpop\tr15
\tpop\tr14
\tpop\tr13
\tpop\tr12
\tpop\trbx
\tpop\trbp
\tret
";

/// `__fd_close(fd)` — `close` syscall, 0 or -errno.
const FD_CLOSE: &str = "
__fd_close:
\tmov\teax, 3
\tsyscall
\tret
";

/// `__path_open(dirfd, dirflags, path_ptr, path_len, oflags, rights, inh,
/// fdflags, fd_out)` — copies the path onto the stack, NUL-terminates,
/// maps dirfd 3 to AT_FDCWD, and issues `openat` with mode 0644. Path
/// lengths outside [0, 4095) yield -EINVAL.
const PATH_OPEN: &str = "
__path_open:
\tpush\trbp
\tmov\trbp, rsp
\tsub\trsp, 4112
\tmov\teax, ecx
\tcmp\teax, 0
\tjl\t.Lpath_open_einval
\tcmp\teax, 4095
\tjge\t.Lpath_open_einval
\tlea\tr10, __coatl_mem[rip]
\tmov\tecx, edx
\txor\tr11d, r11d
.Lpath_open_copy:
\tcmp\tr11d, eax
\tjge\t.Lpath_open_copied
\tmov\tedx, ecx
\tadd\tedx, r11d
\tmovzx\tesi, BYTE PTR [r10+rdx]
\tmov\tBYTE PTR [rsp+r11], sil
\tadd\tr11d, 1
\tjmp\t.Lpath_open_copy
.Lpath_open_copied:
\tmov\tBYTE PTR [rsp+rax], 0
\tcmp\tedi, 3
\tjne\t.Lpath_open_flags
\tmov\tedi, -100
.Lpath_open_flags:
\txor\tedx, edx
\ttest\tr8d, 1
\tjz\t.Lpath_open_call
\tmov\tedx, 577
.Lpath_open_call:
\tmov\trsi, rsp
\tmov\tr10d, 420
\tmov\teax, 257
\tsyscall
\ttest\trax, rax
\tjs\t.Lpath_open_done
\tmov\tecx, DWORD PTR [rbp+32]
\tlea\tr11, __coatl_mem[rip]
\tmov\tDWORD PTR [r11+rcx], eax
\txor\teax, eax
\tjmp\t.Lpath_open_done
.Lpath_open_einval:
\tmov\teax, -22
.Lpath_open_done:
\tmov\trsp, rbp
\tpop\trbp
\tret
";

/// `__tty_get_mode(buf)` — `ioctl(0, TCGETS)` into a termios image at the
/// given linear-memory offset.
const TTY_GET_MODE: &str = "
__tty_get_mode:
\tlea\tr10, __coatl_mem[rip]
\tmov\teax, edi
\tlea\trdx, [r10+rax]
\txor\tedi, edi
\tmov\tesi, 0x5401
\tmov\teax, 16
\tsyscall
\tret
";

/// `__tty_set_raw(buf, vmin, vtime)` — clears IXON in c_iflag and
/// ICANON|ECHO in c_lflag, installs VMIN/VTIME, applies with TCSETS.
const TTY_SET_RAW: &str = "
__tty_set_raw:
\tlea\tr10, __coatl_mem[rip]
\tmov\teax, edi
\tlea\tr8, [r10+rax]
\tmov\tecx, DWORD PTR [r8]
\tand\tecx, 0xfffffbff
\tmov\tDWORD PTR [r8], ecx
\tmov\tecx, DWORD PTR [r8+12]
\tand\tecx, 0xfffffff5
\tmov\tDWORD PTR [r8+12], ecx
\tmov\tBYTE PTR [r8+23], sil
\tmov\tBYTE PTR [r8+22], dl
\txor\tedi, edi
\tmov\tesi, 0x5402
\tmov\trdx, r8
\tmov\teax, 16
\tsyscall
\tret
";

/// `__tty_restore(buf)` — `ioctl(0, TCSETS)` from a termios image.
const TTY_RESTORE: &str = "
__tty_restore:
\tlea\tr10, __coatl_mem[rip]
\tmov\teax, edi
\tlea\trdx, [r10+rax]
\txor\tedi, edi
\tmov\tesi, 0x5402
\tmov\teax, 16
\tsyscall
\tret
";

/// Entry point: run `main` and exit with its result.
const COATL_START: &str = "
coatl_start:
\tcall\tmain
\tmov\tedi, eax
\tmov\teax, 60
\tsyscall
";

/// The fixed prelude routines, in emission order.
pub(super) fn routines() -> Vec<Instruction> {
    vec![
        Instruction::Literal(MEM_ACCESS.to_owned()),
        Instruction::Literal(FD_WRITE.to_owned()),
        Instruction::Literal(FD_READ.to_owned()),
        Instruction::Literal(FD_CLOSE.to_owned()),
        Instruction::Literal(PATH_OPEN.to_owned()),
        Instruction::Literal(TTY_GET_MODE.to_owned()),
        Instruction::Literal(TTY_SET_RAW.to_owned()),
        Instruction::Literal(TTY_RESTORE.to_owned()),
        Instruction::Literal(COATL_START.to_owned()),
    ]
}

/// `__coatl_init_memory` — idempotent under the `__coatl_mem_inited` guard;
/// writes every interned descriptor and byte sequence into linear memory.
pub(super) fn init_memory_routine(strings: &StringTable) -> Vec<Instruction> {
    use Instruction::*;
    use InstructionOperand::*;
    use InstructionSize::*;
    use Reg::*;

    let mut ins = vec![
        Label("__coatl_init_memory".to_owned()),
        Lea(Register(R11), Identifier("__coatl_mem_inited[rip]".to_owned())),
        Mov(Register(Eax), Memory(Dword, R11.to_string())),
        Test(Register(Eax), Register(Eax)),
        Jne(".Linit_memory_done".to_owned()),
        Mov(Memory(Dword, R11.to_string()), Immediate(1)),
        Lea(Register(R11), Identifier("__coatl_mem[rip]".to_owned())),
    ];

    for entry in strings.entries() {
        ins.push(Comment(format!("string \"{}\"", entry.token.trim_matches('"'))));
        ins.push(Mov(
            Memory(Dword, format!("{}+{}", R11, entry.desc_addr)),
            Immediate(i64::from(entry.data_addr)),
        ));
        ins.push(Mov(
            Memory(Dword, format!("{}+{}", R11, entry.desc_addr + 4)),
            Immediate(entry.bytes.len() as i64),
        ));
        for (i, byte) in entry.bytes.iter().enumerate() {
            ins.push(Mov(
                Memory(Byte, format!("{}+{}", R11, entry.data_addr as usize + i)),
                Immediate(i64::from(*byte)),
            ));
        }
        ins.push(Mov(
            Memory(
                Byte,
                format!("{}+{}", R11, entry.data_addr as usize + entry.bytes.len()),
            ),
            Immediate(0),
        ));
    }

    ins.push(Label(".Linit_memory_done".to_owned()));
    ins.push(Xor(Register(Eax), Register(Eax)));
    ins.push(Ret);
    ins
}
