use core::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Datatype {
    F64,
    F32,
    Bf16,
    I32,
    I16,
    I8,
}

impl Datatype {
    pub const fn size(self) -> usize {
        match self {
            Datatype::F64 => 8,
            Datatype::F32 | Datatype::I32 => 4,
            Datatype::Bf16 | Datatype::I16 => 2,
            Datatype::I8 => 1,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Datatype::F64 | Datatype::F32 | Datatype::Bf16)
    }

    /// Accumulation type used when only the input type is known.
    pub const fn default_compute(self) -> Datatype {
        match self {
            Datatype::F64 => Datatype::F64,
            Datatype::F32 | Datatype::Bf16 => Datatype::F32,
            Datatype::I32 | Datatype::I16 | Datatype::I8 => Datatype::I32,
        }
    }

    pub const fn code(self) -> u8 {
        match self {
            Datatype::F64 => 0,
            Datatype::F32 => 1,
            Datatype::Bf16 => 2,
            Datatype::I32 => 3,
            Datatype::I16 => 4,
            Datatype::I8 => 5,
        }
    }

    pub const fn from_code(code: u8) -> Option<Datatype> {
        match code {
            0 => Some(Datatype::F64),
            1 => Some(Datatype::F32),
            2 => Some(Datatype::Bf16),
            3 => Some(Datatype::I32),
            4 => Some(Datatype::I16),
            5 => Some(Datatype::I8),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Datatype::F64 => "f64",
            Datatype::F32 => "f32",
            Datatype::Bf16 => "bf16",
            Datatype::I32 => "i32",
            Datatype::I16 => "i16",
            Datatype::I8 => "i8",
        }
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
