#![cfg(test)]

use crate::*;
use rstest::rstest;
use strum::IntoEnumIterator;

fn collect(f: impl FnOnce(&mut Assembler)) -> Vec<u8> {
    let mut a = Assembler::new();
    f(&mut a);
    a.code().expect("no pending fixups").to_vec()
}

#[rstest]
#[case::mov_rax_zero(&|a: &mut Assembler| a.mov_ri(RegId::RAX, 0), &[0x48, 0xC7, 0xC0, 0, 0, 0, 0])]
#[case::mov_r15_one(&|a: &mut Assembler| a.mov_ri(RegId::R15, 1), &[0x49, 0xC7, 0xC7, 1, 0, 0, 0])]
#[case::mov_rax_wide(&|a: &mut Assembler| a.mov_ri(RegId::RAX, 0x1_0000_0000), &[0x48, 0xB8, 0, 0, 0, 0, 1, 0, 0, 0])]
#[case::mov_r15d_bits(&|a: &mut Assembler| a.mov_ri32(RegId::R15, 0x3F80_0000), &[0x41, 0xBF, 0, 0, 0x80, 0x3F])]
#[case::mov_eax_imm(&|a: &mut Assembler| a.mov_ri32(RegId::RAX, 5), &[0xB8, 5, 0, 0, 0])]
#[case::mov_rdi_r9(&|a: &mut Assembler| a.mov_rr(RegId::RDI, RegId::R9), &[0x49, 0x8B, 0xF9])]
#[case::add_rax_rcx(&|a: &mut Assembler| a.add_rr(RegId::RAX, RegId::RCX), &[0x48, 0x03, 0xC1])]
#[case::add_rax_imm8(&|a: &mut Assembler| a.add_ri(RegId::RAX, 4), &[0x48, 0x83, 0xC0, 4])]
#[case::add_rax_imm32(&|a: &mut Assembler| a.add_ri(RegId::RAX, 300), &[0x48, 0x81, 0xC0, 0x2C, 1, 0, 0])]
#[case::sub_rsp_8(&|a: &mut Assembler| a.sub_ri(RegId::RSP, 8), &[0x48, 0x83, 0xEC, 8])]
#[case::imul_r15_rcx(&|a: &mut Assembler| a.imul_rr(RegId::R15, RegId::RCX), &[0x4C, 0x0F, 0xAF, 0xF9])]
#[case::imul_r15_r8_imm(&|a: &mut Assembler| a.imul_rri(RegId::R15, RegId::R8, 48), &[0x4D, 0x6B, 0xF8, 0x30])]
#[case::cmp_rax_rcx(&|a: &mut Assembler| a.cmp_rr(RegId::RAX, RegId::RCX), &[0x48, 0x3B, 0xC1])]
#[case::cmp_rax_imm(&|a: &mut Assembler| a.cmp_ri(RegId::RAX, 100), &[0x48, 0x83, 0xF8, 0x64])]
#[case::push_rbx(&|a: &mut Assembler| a.push(RegId::RBX), &[0x53])]
#[case::push_r12(&|a: &mut Assembler| a.push(RegId::R12), &[0x41, 0x54])]
#[case::pop_r15(&|a: &mut Assembler| a.pop(RegId::R15), &[0x41, 0x5F])]
#[case::ret(&|a: &mut Assembler| a.ret(), &[0xC3])]
fn gpr_encodings(#[case] emit: &dyn Fn(&mut Assembler), #[case] expect: &[u8]) {
    assert_eq!(collect(|a| emit(a)), expect);
}

#[rstest]
#[case::movss_rdx(&|a: &mut Assembler| a.movss_load(XmmId::XMM0, Mem::base(RegId::RDX)), &[0xF3, 0x0F, 0x10, 0x02])]
#[case::movss_indexed(
    &|a: &mut Assembler| a.movss_load(XmmId::XMM1, Mem::base_index_disp(RegId::RDX, RegId::R10, 8)),
    &[0xF3, 0x42, 0x0F, 0x10, 0x4C, 0x12, 0x08]
)]
#[case::movss_rsp_base(&|a: &mut Assembler| a.movss_load(XmmId::XMM8, Mem::base(RegId::RSP)), &[0xF3, 0x44, 0x0F, 0x10, 0x04, 0x24])]
#[case::movss_rbp_base(&|a: &mut Assembler| a.movss_load(XmmId::XMM0, Mem::base(RegId::RBP)), &[0xF3, 0x0F, 0x10, 0x45, 0x00])]
#[case::movd(&|a: &mut Assembler| a.movd(XmmId::XMM0, RegId::R15), &[0x66, 0x41, 0x0F, 0x6E, 0xC7])]
#[case::movaps(&|a: &mut Assembler| a.movaps(XmmId::XMM1, XmmId::XMM2), &[0x0F, 0x28, 0xCA])]
#[case::movaps_high(&|a: &mut Assembler| a.movaps(XmmId::XMM14, XmmId::XMM3), &[0x44, 0x0F, 0x28, 0xF3])]
#[case::movntps(&|a: &mut Assembler| a.movntps(Mem::base(RegId::RDI), XmmId::XMM1), &[0x0F, 0x2B, 0x0F])]
#[case::movntps_disp(&|a: &mut Assembler| a.movntps(Mem::base_disp(RegId::RDI, 16), XmmId::XMM1), &[0x0F, 0x2B, 0x4F, 0x10])]
#[case::addps(&|a: &mut Assembler| a.addps(XmmId::XMM0, XmmId::XMM1), &[0x0F, 0x58, 0xC1])]
#[case::subps(&|a: &mut Assembler| a.subps(XmmId::XMM3, XmmId::XMM2), &[0x0F, 0x5C, 0xDA])]
#[case::mulps_high(&|a: &mut Assembler| a.mulps(XmmId::XMM13, XmmId::XMM13), &[0x45, 0x0F, 0x59, 0xED])]
#[case::divps(&|a: &mut Assembler| a.divps(XmmId::XMM0, XmmId::XMM7), &[0x0F, 0x5E, 0xC7])]
#[case::andps(&|a: &mut Assembler| a.andps(XmmId::XMM0, XmmId::XMM1), &[0x0F, 0x54, 0xC1])]
#[case::andnps(&|a: &mut Assembler| a.andnps(XmmId::XMM0, XmmId::XMM1), &[0x0F, 0x55, 0xC1])]
#[case::orps(&|a: &mut Assembler| a.orps(XmmId::XMM0, XmmId::XMM1), &[0x0F, 0x56, 0xC1])]
#[case::xorps_self(&|a: &mut Assembler| a.xorps(XmmId::XMM2, XmmId::XMM2), &[0x0F, 0x57, 0xD2])]
#[case::broadcast_shuffle(&|a: &mut Assembler| a.shufps(XmmId::XMM0, XmmId::XMM0, 0, 0, 0, 0), &[0x0F, 0xC6, 0xC0, 0x00])]
#[case::punpckldq(&|a: &mut Assembler| a.punpckldq(XmmId::XMM0, XmmId::XMM15), &[0x66, 0x41, 0x0F, 0x62, 0xC7])]
#[case::punpcklqdq(&|a: &mut Assembler| a.punpcklqdq(XmmId::XMM0, XmmId::XMM1), &[0x66, 0x0F, 0x6C, 0xC1])]
#[case::cvtsi2ss(&|a: &mut Assembler| a.cvtsi2ss(XmmId::XMM2, RegId::RCX), &[0xF3, 0x48, 0x0F, 0x2A, 0xD1])]
fn sse_encodings(#[case] emit: &dyn Fn(&mut Assembler), #[case] expect: &[u8]) {
    assert_eq!(collect(|a| emit(a)), expect);
}

#[test]
fn cmpps_encodes_every_predicate_in_its_immediate() {
    for pred in CmpOp::iter() {
        let code = collect(|a| a.cmpps(XmmId::XMM0, XmmId::XMM1, pred));
        assert_eq!(code[..3], [0x0F, 0xC2, 0xC1]);
        assert_eq!(code[3], pred as u8);
    }
}

#[test]
fn shuffle_selector_order_matches_the_lane_comment() {
    // dst lanes come from (a, b) of dst and (c, d) of src
    let code = collect(|a| a.shufps(XmmId::XMM3, XmmId::XMM2, 1, 3, 0, 2));
    assert_eq!(code, [0x0F, 0xC6, 0xDA, 0b10_00_11_01]);
}

#[test]
fn backward_branch_resolves_immediately() {
    let mut a = Assembler::new();
    a.label("loop").unwrap();
    a.jl("loop");
    assert_eq!(a.code().unwrap(), &[0x0F, 0x8C, 0xFA, 0xFF, 0xFF, 0xFF]);
}

#[test]
fn forward_branch_patches_at_finalize() {
    let mut a = Assembler::new();
    a.jmp("end");
    assert!(matches!(a.code(), Err(AsmError::PendingFixups)));
    a.label("end").unwrap();
    a.finalize().unwrap();
    assert_eq!(a.code().unwrap(), &[0xE9, 0x00, 0x00, 0x00, 0x00]);
}

#[test]
fn unbound_label_is_reported_at_finalize() {
    let mut a = Assembler::new();
    a.jl("nowhere");
    let err = a.finalize().unwrap_err();
    assert!(matches!(err, AsmError::UnboundLabel(name) if name == "nowhere"));
}

#[test]
fn duplicate_labels_are_rejected() {
    let mut a = Assembler::new();
    a.label("x").unwrap();
    let err = a.label("x").unwrap_err();
    assert!(matches!(err, AsmError::DuplicateLabel(_)));
}

#[test]
fn loop_skeleton_matches_a_known_listing() {
    // mov rax, 0; xloop: add rax, 4; cmp rax, 16; jl xloop; ret
    let mut a = Assembler::new();
    a.mov_ri(RegId::RAX, 0);
    a.label("xloop").unwrap();
    a.add_ri(RegId::RAX, 4);
    a.cmp_ri(RegId::RAX, 16);
    a.jl("xloop");
    a.ret();
    a.finalize().unwrap();
    assert_eq!(
        a.code().unwrap(),
        &[
            0x48, 0xC7, 0xC0, 0, 0, 0, 0, // mov rax, 0
            0x48, 0x83, 0xC0, 4, // add rax, 4
            0x48, 0x83, 0xF8, 16, // cmp rax, 16
            0x0F, 0x8C, 0xF2, 0xFF, 0xFF, 0xFF, // jl xloop (-14)
            0xC3, // ret
        ]
    );
}
