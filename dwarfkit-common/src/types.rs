//! Target architectures and their DWARF register numbering.

use std::fmt;
use std::str;

/// DWARF register names for 32-bit x86, by register number.
static I386: &[&str] = &[
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "eip", "eflags", "", "st0", "st1",
    "st2", "st3", "st4", "st5", "st6", "st7", "", "", "xmm0", "xmm1", "xmm2", "xmm3", "xmm4",
    "xmm5", "xmm6", "xmm7", "mm0", "mm1", "mm2", "mm3", "mm4", "mm5", "mm6", "mm7", "fcw", "fsw",
    "mxcsr", "es", "cs", "ss", "ds", "fs", "gs", "", "", "tr", "ldtr",
];

/// DWARF register names for x86-64, by register number.
static X86_64: &[&str] = &[
    "rax", "rdx", "rcx", "rbx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15", "rip", "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8",
    "xmm9", "xmm10", "xmm11", "xmm12", "xmm13", "xmm14", "xmm15", "st0", "st1", "st2", "st3",
    "st4", "st5", "st6", "st7", "mm0", "mm1", "mm2", "mm3", "mm4", "mm5", "mm6", "mm7", "rflags",
    "es", "cs", "ss", "ds", "fs", "gs", "", "", "fs.base", "gs.base", "", "", "tr", "ldtr",
    "mxcsr", "fcw", "fsw",
];

/// DWARF register names for AArch64, by register number.
static ARM64: &[&str] = &[
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "x29", "x30", "sp", "", "ELR_mode", "RA_SIGN_STATE", "", "", "", "", "", "", "", "",
    "", "", "", "VG", "FFR", "p0", "p1", "p2", "p3", "p4", "p5", "p6", "p7", "p8", "p9", "p10",
    "p11", "p12", "p13", "p14", "p15", "v0", "v1", "v2", "v3", "v4", "v5", "v6", "v7", "v8", "v9",
    "v10", "v11", "v12", "v13", "v14", "v15", "v16", "v17", "v18", "v19", "v20", "v21", "v22",
    "v23", "v24", "v25", "v26", "v27", "v28", "v29", "v30", "v31", "z0", "z1", "z2", "z3", "z4",
    "z5", "z6", "z7", "z8", "z9", "z10", "z11", "z12", "z13", "z14", "z15", "z16", "z17", "z18",
    "z19", "z20", "z21", "z22", "z23", "z24", "z25", "z26", "z27", "z28", "z29", "z30", "z31",
];

/// DWARF register names for 32-bit ARM, by register number.
static ARM: &[&str] = &[
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "sp", "lr",
    "pc",
];

/// Represents a family of CPUs.
///
/// A family groups architectures that share a pointer size and a DWARF register numbering. It is
/// what the call frame decoder needs to name the registers referenced by unwind rules.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CpuFamily {
    /// Any other CPU family that is not explicitly supported.
    #[default]
    Unknown,
    /// 32-bit little-endian x86.
    Intel32,
    /// 64-bit x86, also known as `x86_64`.
    Amd64,
    /// 32-bit ARM.
    Arm32,
    /// 64-bit ARM.
    Arm64,
    /// 32-bit PowerPC.
    Ppc32,
    /// 64-bit PowerPC.
    Ppc64,
    /// 32-bit MIPS.
    Mips32,
    /// 64-bit MIPS.
    Mips64,
    /// 32-bit RISC-V.
    RiscV32,
    /// 64-bit RISC-V.
    RiscV64,
}

impl CpuFamily {
    /// Returns the native pointer size, which is also the default DWARF address size.
    ///
    /// Returns `None` if the CPU family is unknown.
    ///
    /// # Examples
    ///
    /// ```
    /// use dwarfkit_common::CpuFamily;
    ///
    /// assert_eq!(CpuFamily::Amd64.pointer_size(), Some(8));
    /// assert_eq!(CpuFamily::Arm32.pointer_size(), Some(4));
    /// ```
    pub fn pointer_size(self) -> Option<u8> {
        match self {
            CpuFamily::Unknown => None,
            CpuFamily::Amd64
            | CpuFamily::Arm64
            | CpuFamily::Ppc64
            | CpuFamily::Mips64
            | CpuFamily::RiscV64 => Some(8),
            CpuFamily::Intel32
            | CpuFamily::Arm32
            | CpuFamily::Ppc32
            | CpuFamily::Mips32
            | CpuFamily::RiscV32 => Some(4),
        }
    }

    /// Returns the DWARF name of a register, if the family defines one for that number.
    ///
    /// # Examples
    ///
    /// ```
    /// use dwarfkit_common::CpuFamily;
    ///
    /// assert_eq!(CpuFamily::Amd64.dwarf_register_name(16), Some("rip"));
    /// assert_eq!(CpuFamily::Arm64.dwarf_register_name(31), Some("sp"));
    /// assert_eq!(CpuFamily::Unknown.dwarf_register_name(0), None);
    /// ```
    pub fn dwarf_register_name(self, register: u64) -> Option<&'static str> {
        let table = match self {
            CpuFamily::Intel32 => I386,
            CpuFamily::Amd64 => X86_64,
            CpuFamily::Arm64 => ARM64,
            CpuFamily::Arm32 => ARM,
            _ => return None,
        };

        let name = table.get(usize::try_from(register).ok()?)?;
        Some(*name).filter(|name| !name.is_empty())
    }

    /// Renders a register for display, falling back to `r<N>` for unnamed registers.
    ///
    /// # Examples
    ///
    /// ```
    /// use dwarfkit_common::CpuFamily;
    ///
    /// assert_eq!(CpuFamily::Intel32.display_register(5), "ebp");
    /// assert_eq!(CpuFamily::Mips32.display_register(29), "r29");
    /// ```
    pub fn display_register(self, register: u64) -> String {
        match self.dwarf_register_name(register) {
            Some(name) => name.to_owned(),
            None => format!("r{register}"),
        }
    }
}

/// An error returned for an unrecognized machine tag.
#[derive(Debug)]
pub struct UnknownArchError;

impl fmt::Display for UnknownArchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown architecture")
    }
}

impl std::error::Error for UnknownArchError {}

/// The machine architecture a binary was compiled for.
///
/// Container readers describe the machine with free-form tags such as `"x64"`, `"AArch64"` or
/// `"EM_386"`. [`FromStr`](str::FromStr) accepts the common spellings case-insensitively, and
/// [`Arch::name`] returns the canonical one.
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Arch {
    #[default]
    Unknown,
    X86,
    Amd64,
    Arm,
    Arm64,
    Ppc,
    Ppc64,
    Mips,
    Mips64,
    RiscV32,
    RiscV64,
}

impl Arch {
    /// Returns the CPU family of this architecture.
    pub fn cpu_family(self) -> CpuFamily {
        match self {
            Arch::Unknown => CpuFamily::Unknown,
            Arch::X86 => CpuFamily::Intel32,
            Arch::Amd64 => CpuFamily::Amd64,
            Arch::Arm => CpuFamily::Arm32,
            Arch::Arm64 => CpuFamily::Arm64,
            Arch::Ppc => CpuFamily::Ppc32,
            Arch::Ppc64 => CpuFamily::Ppc64,
            Arch::Mips => CpuFamily::Mips32,
            Arch::Mips64 => CpuFamily::Mips64,
            Arch::RiscV32 => CpuFamily::RiscV32,
            Arch::RiscV64 => CpuFamily::RiscV64,
        }
    }

    /// Returns the canonical name of this architecture.
    pub fn name(self) -> &'static str {
        match self {
            Arch::Unknown => "unknown",
            Arch::X86 => "x86",
            Arch::Amd64 => "x86_64",
            Arch::Arm => "arm",
            Arch::Arm64 => "arm64",
            Arch::Ppc => "ppc",
            Arch::Ppc64 => "ppc64",
            Arch::Mips => "mips",
            Arch::Mips64 => "mips64",
            Arch::RiscV32 => "riscv32",
            Arch::RiscV64 => "riscv64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl str::FromStr for Arch {
    type Err = UnknownArchError;

    fn from_str(string: &str) -> Result<Arch, UnknownArchError> {
        Ok(match string.to_ascii_lowercase().as_str() {
            "unknown" => Arch::Unknown,
            "x86" | "i386" | "i686" | "em_386" => Arch::X86,
            "x86_64" | "x86-64" | "x64" | "amd64" | "em_x86_64" => Arch::Amd64,
            "arm" | "em_arm" => Arch::Arm,
            "arm64" | "aarch64" | "em_aarch64" => Arch::Arm64,
            "ppc" | "powerpc" | "em_ppc" => Arch::Ppc,
            "ppc64" | "powerpc64" | "64-bit powerpc" | "em_ppc64" => Arch::Ppc64,
            "mips" | "em_mips" => Arch::Mips,
            "mips64" => Arch::Mips64,
            "riscv32" => Arch::RiscV32,
            "riscv64" | "risc-v" | "em_riscv" => Arch::RiscV64,
            _ => return Err(UnknownArchError),
        })
    }
}

#[cfg(feature = "serde")]
mod derive_serde {
    impl ::serde_::ser::Serialize for super::Arch {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: ::serde_::ser::Serializer,
        {
            serializer.serialize_str(self.name())
        }
    }

    impl<'de> ::serde_::de::Deserialize<'de> for super::Arch {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: ::serde_::de::Deserializer<'de>,
        {
            <::std::borrow::Cow<str>>::deserialize(deserializer)?
                .parse()
                .map_err(::serde_::de::Error::custom)
        }
    }
}
