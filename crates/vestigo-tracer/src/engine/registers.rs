macro_rules! registers {
    ($($variant:ident => $name:literal),* $(,)?) => {
        /// CPU register (arch-independent).
        ///
        /// The set covers the general purpose registers of the x86-64, IA-32
        /// and AArch64 modes. Registers outside this set (vector, flags,
        /// sub-registers) are never looked up in a [RegisterSnapshot].
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum Register {
            $(
                #[doc = concat!("The `", $name, "` register.")]
                $variant,
            )*
        }

        impl Register {
            /// All the known registers.
            pub const ALL: &'static [Register] = &[$(Register::$variant),*];

            /// Returns the canonical (disassembler) name of the register.
            pub const fn name(self) -> &'static str {
                match self {
                    $(Register::$variant => $name,)*
                }
            }

            fn lookup(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(Register::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

registers! {
    Rax => "rax", Rbx => "rbx", Rcx => "rcx", Rdx => "rdx",
    Rsi => "rsi", Rdi => "rdi", Rbp => "rbp", Rsp => "rsp",
    R8 => "r8", R9 => "r9", R10 => "r10", R11 => "r11",
    R12 => "r12", R13 => "r13", R14 => "r14", R15 => "r15",
    Rip => "rip",

    Eax => "eax", Ebx => "ebx", Ecx => "ecx", Edx => "edx",
    Esi => "esi", Edi => "edi", Ebp => "ebp", Esp => "esp",
    Eip => "eip",

    X0 => "x0", X1 => "x1", X2 => "x2", X3 => "x3",
    X4 => "x4", X5 => "x5", X6 => "x6", X7 => "x7",
    X8 => "x8", X9 => "x9", X10 => "x10", X11 => "x11",
    X12 => "x12", X13 => "x13", X14 => "x14", X15 => "x15",
    X16 => "x16", X17 => "x17", X18 => "x18", X19 => "x19",
    X20 => "x20", X21 => "x21", X22 => "x22", X23 => "x23",
    X24 => "x24", X25 => "x25", X26 => "x26", X27 => "x27",
    X28 => "x28", Fp => "fp", Lr => "lr", Sp => "sp",
    Pc => "pc",
}

impl Register {
    /// Number of known registers.
    pub const COUNT: usize = Self::ALL.len();

    /// Parses a register from its disassembler name.
    ///
    /// AArch64 aliases (`x29`, `x30`) are accepted as well.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "x29" => Some(Self::Fp),
            "x30" => Some(Self::Lr),
            name => Self::lookup(name),
        }
    }
}

impl std::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Register state of the traced thread, at the time of a callout.
///
/// Registers which are not part of the current CPU mode (e.g., `eax` in a
/// 64-bit snapshot) are simply absent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterSnapshot {
    pc: u64,
    values: [Option<u64>; Register::COUNT],
}

impl RegisterSnapshot {
    /// Creates an empty snapshot at the given instruction address.
    pub const fn new(pc: u64) -> Self {
        Self {
            pc,
            values: [None; Register::COUNT],
        }
    }

    /// Returns a copy of this snapshot with `reg` set to `value`.
    pub fn with(mut self, reg: Register, value: u64) -> Self {
        self.set(reg, value);
        self
    }

    /// Instruction address of the snapshot.
    pub const fn pc(&self) -> u64 {
        self.pc
    }

    /// Returns the value of `reg`, if present in this snapshot.
    pub fn get(&self, reg: Register) -> Option<u64> {
        self.values[reg as usize]
    }

    /// Sets the value of `reg`.
    pub fn set(&mut self, reg: Register, value: u64) {
        self.values[reg as usize] = Some(value);
    }

    /// Removes `reg` from the snapshot.
    pub fn clear(&mut self, reg: Register) {
        self.values[reg as usize] = None;
    }

    /// Iterates over the registers present in the snapshot.
    pub fn iter(&self) -> impl Iterator<Item = (Register, u64)> + '_ {
        Register::ALL
            .iter()
            .filter_map(|&reg| self.get(reg).map(|value| (reg, value)))
    }
}

impl Extend<(Register, u64)> for RegisterSnapshot {
    fn extend<I: IntoIterator<Item = (Register, u64)>>(&mut self, iter: I) {
        for (reg, value) in iter {
            self.set(reg, value);
        }
    }
}
