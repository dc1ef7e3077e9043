use anyhow::{bail, Result};
use iced_x86::{
    code_asm::*, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, Instruction,
};

use crate::context::Registers;
use crate::memory::read_bytes;

/// Bytes the SysV ABI allows a function to use below `rsp` without adjusting it
#[cfg(unix)]
const RED_ZONE: i32 = 128;
#[cfg(not(unix))]
const RED_ZONE: i32 = 0;

/// Size of the `xmm` area of [`Registers`]
const XMM_AREA: i32 = 16 * 16;

/// Decode whole instructions at `target` until at least `min_len` bytes are covered.
pub(crate) fn stolen_instructions(target: usize, min_len: usize) -> Result<Vec<Instruction>> {
    // longest x86 instruction is 15 bytes
    let bytes = unsafe { read_bytes(target, min_len + 15) };
    let mut decoder = Decoder::with_ip(64, &bytes, target as u64, DecoderOptions::NONE);

    let mut instructions = vec![];
    let mut len = 0;
    while len < min_len {
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            bail!("undecodable instruction at {:#x}", instruction.ip());
        }
        len += instruction.len();
        instructions.push(instruction);

        let ends_block = matches!(
            instruction.flow_control(),
            FlowControl::Return
                | FlowControl::UnconditionalBranch
                | FlowControl::IndirectBranch
                | FlowControl::Interrupt
        );
        if ends_block && len < min_len {
            bail!(
                "code at {target:#x} ends after {len} bytes, {min_len} are needed for the redirect"
            );
        }
    }
    Ok(instructions)
}

pub(crate) struct Trampoline {
    pub code: Vec<u8>,
    /// (original ip, relocated ip) for each stolen instruction
    pub relocated: Vec<(usize, usize)>,
}

/// Assemble the trampoline for a hook at `target`, to be placed at `address`.
///
/// The register frame pushed here must match [`Registers`] field for field: `rflags` is
/// pushed first and ends up highest, the `xmm` area is stored last at the lowest address.
pub(crate) fn assemble(
    address: usize,
    target: usize,
    stolen: &[Instruction],
    dispatch: usize,
    callback: usize,
) -> Result<Trampoline> {
    let mut a = CodeAssembler::new(64)?;

    if RED_ZONE != 0 {
        a.lea(rsp, ptr(rsp - RED_ZONE))?;
    }
    a.pushfq()?;
    a.push(rax)?;
    a.push(rcx)?;
    a.push(rdx)?;
    a.push(rbx)?;
    // rsp at the hooked instruction, 5 pushes ago
    a.lea(rax, ptr(rsp + (5 * 8 + RED_ZONE)))?;
    a.push(rax)?;
    a.push(rbp)?;
    a.push(rsi)?;
    a.push(rdi)?;
    for reg in [r8, r9, r10, r11, r12, r13, r14, r15] {
        a.push(reg)?;
    }
    a.sub(rsp, XMM_AREA)?;
    for (i, reg) in xmm_registers().into_iter().enumerate() {
        a.movups(xmmword_ptr(rsp + i as i32 * 16), reg)?;
    }

    // rbx is callee saved and keeps the frame across the call
    a.mov(rbx, rsp)?;
    a.and(rsp, -16)?;
    // shadow space
    a.sub(rsp, 32)?;
    #[cfg(windows)]
    {
        a.mov(rcx, rbx)?;
        a.mov(rdx, callback as u64)?;
    }
    #[cfg(not(windows))]
    {
        a.mov(rdi, rbx)?;
        a.mov(rsi, callback as u64)?;
    }
    a.mov(rax, dispatch as u64)?;
    a.call(rax)?;
    a.mov(rsp, rbx)?;

    for (i, reg) in xmm_registers().into_iter().enumerate() {
        a.movups(reg, xmmword_ptr(rsp + i as i32 * 16))?;
    }
    a.add(rsp, XMM_AREA)?;
    for reg in [r15, r14, r13, r12, r11, r10, r9, r8] {
        a.pop(reg)?;
    }
    a.pop(rdi)?;
    a.pop(rsi)?;
    a.pop(rbp)?;
    // saved rsp, writes to it are dropped
    a.add(rsp, 8)?;
    a.pop(rbx)?;
    a.pop(rdx)?;
    a.pop(rcx)?;
    a.pop(rax)?;
    a.popfq()?;
    if RED_ZONE != 0 {
        a.lea(rsp, ptr(rsp + RED_ZONE))?;
    }

    let mut labels = Vec::with_capacity(stolen.len());
    for instruction in stolen {
        let mut label = a.create_label();
        a.set_label(&mut label)?;
        a.add_instruction(*instruction)?;
        labels.push(label);
    }

    let stolen_len: usize = stolen.iter().map(Instruction::len).sum();
    let mut resume = a.create_label();
    a.jmp(qword_ptr(resume))?;
    a.set_label(&mut resume)?;
    a.dq(&[(target + stolen_len) as u64])?;

    let result = a.assemble_options(
        address as u64,
        BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS,
    )?;

    let relocated = stolen
        .iter()
        .zip(&labels)
        .map(|(instruction, label)| {
            Ok((instruction.ip() as usize, result.label_ip(label)? as usize))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Trampoline {
        code: result.inner.code_buffer,
        relocated,
    })
}

fn xmm_registers() -> [AsmRegisterXmm; 16] {
    [
        xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7, xmm8, xmm9, xmm10, xmm11, xmm12, xmm13,
        xmm14, xmm15,
    ]
}

const _: () = assert!(std::mem::size_of::<Registers>() as i32 == XMM_AREA + 17 * 8);

/// Bytes written over the hooked instruction(s): a jump to `destination` padded with
/// `int3` to `len`
pub(crate) fn redirect(target: usize, destination: usize, len: usize) -> Vec<u8> {
    let mut bytes = match crate::memory::rel32(target + 5, destination) {
        Some(rel) => {
            let mut bytes = vec![0xe9];
            bytes.extend_from_slice(&rel.to_le_bytes());
            bytes
        }
        None => {
            // jmp qword ptr [rip+0]
            let mut bytes = vec![0xff, 0x25, 0, 0, 0, 0];
            bytes.extend_from_slice(&(destination as u64).to_le_bytes());
            bytes
        }
    };
    bytes.resize(len.max(bytes.len()), 0xcc);
    bytes
}

/// Length of the redirect [`redirect`] would emit
pub(crate) fn redirect_len(target: usize, destination: usize) -> usize {
    if crate::memory::rel32(target + 5, destination).is_some() {
        5
    } else {
        14
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory::ExecBlock;

    #[test]
    fn test_redirect() {
        assert_eq!(
            vec![0xe9, 0xfb, 0x0f, 0, 0, 0xcc, 0xcc],
            redirect(0x1000, 0x2000, 7)
        );
        assert_eq!(5, redirect_len(0x1000, 0x2000));
        assert_eq!(
            vec![0xff, 0x25, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0],
            redirect(0x1000, 0x1_0000_0000, 14)
        );
        assert_eq!(14, redirect_len(0x1000, 0x1_0000_0000));
    }

    #[test]
    fn test_stolen_instructions() {
        let block = ExecBlock::alloc(0x1000).unwrap();
        let code = [
            0x48, 0x89, 0x5c, 0x24, 0x08, // mov [rsp+8],rbx
            0x48, 0x8d, 0x05, 0x10, 0x00, 0x00, 0x00, // lea rax,[rip+0x10]
            0xc3, // ret
        ];
        unsafe {
            block.write(0, &[0xcc; 0x40]).unwrap();
            block.write(0, &code).unwrap();
        }
        let target = block.address();

        let stolen = stolen_instructions(target, 5).unwrap();
        assert_eq!(1, stolen.len());

        let stolen = stolen_instructions(target, 6).unwrap();
        assert_eq!(2, stolen.len());
        assert_eq!((target + 5) as u64, stolen[1].ip());

        assert!(stolen_instructions(target, 14).is_err());
    }

    #[test]
    fn test_assemble_relocates_rip_relative() {
        let source = ExecBlock::alloc(0x1000).unwrap();
        let code = [
            0x48, 0x8d, 0x05, 0x10, 0x00, 0x00, 0x00, // lea rax,[rip+0x10]
            0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0xc3,
        ];
        unsafe { source.write(0, &code).unwrap() };
        let target = source.address();
        let stolen = stolen_instructions(target, 5).unwrap();

        // rip relative operands only relocate within +-2GiB
        let address = target + 0x100;
        let trampoline = assemble(address, target, &stolen, 0x1234, 0x5678).unwrap();
        assert_eq!(vec![(target, trampoline.relocated[0].1)], trampoline.relocated);
        let relocated = trampoline.relocated[0].1;
        assert!(relocated > address && relocated < address + trampoline.code.len());

        let mut decoder = Decoder::with_ip(
            64,
            &trampoline.code[relocated - address..],
            relocated as u64,
            DecoderOptions::NONE,
        );
        let lea = decoder.decode();
        assert_eq!(iced_x86::Mnemonic::Lea, lea.mnemonic());
        assert_eq!((target + 7 + 0x10) as u64, lea.memory_displacement64());
        let jmp = decoder.decode();
        assert_eq!(iced_x86::Mnemonic::Jmp, jmp.mnemonic());

        let resume_offset = trampoline.code.len() - 8;
        assert_eq!(
            ((target + 7) as u64).to_le_bytes(),
            trampoline.code[resume_offset..]
        );
    }
}
