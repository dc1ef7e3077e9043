/// A saved `xmm` register
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Xmm([u8; 16]);

impl Xmm {
    pub fn f32(&self, lane: usize) -> f32 {
        f32::from_ne_bytes(self.lane(lane))
    }
    pub fn set_f32(&mut self, lane: usize, value: f32) {
        self.set_lane(lane, value.to_ne_bytes());
    }
    pub fn f64(&self, lane: usize) -> f64 {
        f64::from_ne_bytes(self.lane(lane))
    }
    pub fn set_f64(&mut self, lane: usize, value: f64) {
        self.set_lane(lane, value.to_ne_bytes());
    }
    pub fn u32(&self, lane: usize) -> u32 {
        u32::from_ne_bytes(self.lane(lane))
    }
    pub fn set_u32(&mut self, lane: usize, value: u32) {
        self.set_lane(lane, value.to_ne_bytes());
    }
    pub fn u64(&self, lane: usize) -> u64 {
        u64::from_ne_bytes(self.lane(lane))
    }
    pub fn set_u64(&mut self, lane: usize, value: u64) {
        self.set_lane(lane, value.to_ne_bytes());
    }
    pub fn bytes(&self) -> [u8; 16] {
        self.0
    }

    /// Panics if `lane` is out of range for the lane width
    fn lane<const N: usize>(&self, lane: usize) -> [u8; N] {
        self.0[lane * N..(lane + 1) * N].try_into().unwrap()
    }
    fn set_lane<const N: usize>(&mut self, lane: usize, bytes: [u8; N]) {
        self.0[lane * N..(lane + 1) * N].copy_from_slice(&bytes);
    }
}

impl std::fmt::Debug for Xmm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Xmm({:#034x})", u128::from_le_bytes(self.0))
    }
}

/// Register file as saved by the hook trampoline, lowest address first. The layout is
/// shared with the assembly in `trampoline.rs`.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Registers {
    pub xmm: [Xmm; 16],
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    pub rflags: u64,
}

const _: () = assert!(std::mem::size_of::<Registers>() == 16 * 16 + 17 * 8);

/// What a hook callback gets to see and change of the interrupted thread
pub struct Context<'a> {
    registers: &'a mut Registers,
}

macro_rules! gpr {
    ($($reg:ident $set:ident,)*) => {
        $(
            pub fn $reg(&self) -> u64 {
                self.registers.$reg
            }
            pub fn $set(&mut self, value: u64) {
                self.registers.$reg = value;
            }
        )*
    };
}

macro_rules! xmm {
    ($($reg:ident $index:literal,)*) => {
        $(
            pub fn $reg(&mut self) -> &mut Xmm {
                &mut self.registers.xmm[$index]
            }
        )*
    };
}

impl<'a> Context<'a> {
    pub fn new(registers: &'a mut Registers) -> Self {
        Self { registers }
    }

    gpr! {
        rax set_rax,
        rbx set_rbx,
        rcx set_rcx,
        rdx set_rdx,
        rsi set_rsi,
        rdi set_rdi,
        rbp set_rbp,
        r8 set_r8,
        r9 set_r9,
        r10 set_r10,
        r11 set_r11,
        r12 set_r12,
        r13 set_r13,
        r14 set_r14,
        r15 set_r15,
        rflags set_rflags,
    }

    /// Stack pointer at the hooked instruction. Changes to the stack pointer are not
    /// supported.
    pub fn rsp(&self) -> u64 {
        self.registers.rsp
    }

    xmm! {
        xmm0 0,
        xmm1 1,
        xmm2 2,
        xmm3 3,
        xmm4 4,
        xmm5 5,
        xmm6 6,
        xmm7 7,
        xmm8 8,
        xmm9 9,
        xmm10 10,
        xmm11 11,
        xmm12 12,
        xmm13 13,
        xmm14 14,
        xmm15 15,
    }
}
