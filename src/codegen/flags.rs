//! Condition codes without a flags register.
//!
//! Every flag-setting instruction latches two scratch values: `sres`, the
//! result computed in signed arithmetic wide enough not to wrap, and `ures`,
//! the result computed in unsigned 32-bit arithmetic. Byte results are
//! scaled by 256 so one set of predicates serves both widths:
//!
//! * ZF: low 16 bits of `ures` are zero
//! * SF: bit 15 of `ures`
//! * CF: bit 16 of `ures` (carry out, or borrow wrapping into the high bits)
//! * OF: `sres` outside the signed 16-bit range
//!
//! [`Scratch`] is the same model in Rust; the generated C macros in
//! [`PRELUDE`] must agree with it.

use crate::instruction::Condition;

/// Flag predicates and helpers emitted at the top of every program.
pub const PRELUDE: &str = r#"#define ZF ((r.ures & 0xFFFFu) == 0)
#define SF ((r.ures & 0x8000u) != 0)
#define CF ((r.ures & 0x10000u) != 0)
#define OF (r.sres < -0x8000 || r.sres > 0x7FFF)
#define CFV ((r.ures >> 16) & 1u)

#define LATCH16(s, u) (r.sres = (int32_t)(s), r.ures = (uint32_t)(u))
#define LATCH8(s, u) (r.sres = (int32_t)(s) * 256, r.ures = (uint32_t)(u) << 8)
#define LATCHNC16(s, u) (r.sres = (int32_t)(s), r.ures = ((uint32_t)(u) & 0xFFFFu) | (r.ures & 0x10000u))
#define LATCHNC8(s, u) (r.sres = (int32_t)(s) * 256, r.ures = (((uint32_t)(u) & 0xFFu) << 8) | (r.ures & 0x10000u))
#define SETCF(c) (r.ures = (r.ures & 0xFFFFu) | ((uint32_t)((c) != 0) << 16))

static inline uint16_t flags_get(const struct cpu *c)
{
    uint16_t f = 0x0002;
    if (c->ures & 0x10000u) f |= 0x0001;
    if ((c->ures & 0xFFFFu) == 0) f |= 0x0040;
    if (c->ures & 0x8000u) f |= 0x0080;
    if (c->ifl) f |= 0x0200;
    if (c->df) f |= 0x0400;
    if (c->sres < -0x8000 || c->sres > 0x7FFF) f |= 0x0800;
    return f;
}

static inline void flags_set(struct cpu *c, uint16_t f)
{
    c->ures = ((uint32_t)(f & 0x0001) << 16) | ((f & 0x0040) ? 0 : ((f & 0x0080) ? 0x8000u : 1));
    c->sres = (f & 0x0800) ? 0x8000 : 0;
    c->ifl = (f >> 9) & 1;
    c->df = (f >> 10) & 1;
}
"#;

/// `ures` bits below the carry: the (scaled) result
pub const RESULT_MASK: u32 = 0xffff;
/// `ures` bit holding the result's sign
pub const SIGN_BIT: u32 = 0x8000;
/// `ures` bit holding the carry out
pub const CARRY_BIT: u32 = 0x1_0000;
/// Byte results are shifted up this far before latching
pub const BYTE_SHIFT: u32 = 8;

/// FLAGS register bits.
pub const CARRY: u16 = 0x0001;
pub const ZERO: u16 = 0x0040;
pub const SIGN: u16 = 0x0080;
pub const OVERFLOW: u16 = 0x0800;

/// C expression for a branch condition; `None` for parity, which the
/// scratch model cannot answer.
pub fn condition_expr(cond: Condition) -> Option<&'static str> {
    let expr = match cond {
        Condition::Overflow => "OF",
        Condition::NoOverflow => "!OF",
        Condition::Below => "CF",
        Condition::AboveOrEqual => "!CF",
        Condition::Equal => "ZF",
        Condition::NotEqual => "!ZF",
        Condition::BelowOrEqual => "(CF || ZF)",
        Condition::Above => "(!CF && !ZF)",
        Condition::Sign => "SF",
        Condition::NoSign => "!SF",
        Condition::Less => "(SF != OF)",
        Condition::GreaterOrEqual => "(SF == OF)",
        Condition::LessOrEqual => "(ZF || SF != OF)",
        Condition::Greater => "(!ZF && SF == OF)",
        Condition::Parity | Condition::NoParity => return None,
    };
    Some(expr)
}

/// The latched scratch pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scratch {
    pub sres: i32,
    pub ures: u32,
}

impl Scratch {
    /// Latch a result the way `LATCH8`/`LATCH16` do.
    pub fn latch(width: u8, sres: i32, ures: u32) -> Self {
        if width == 1 {
            Self {
                sres: sres.wrapping_mul(1 << BYTE_SHIFT),
                ures: ures << BYTE_SHIFT,
            }
        } else {
            Self { sres, ures }
        }
    }

    /// Scratch after `a + b` (plus `carry`) at `width` bytes.
    pub fn add(width: u8, a: u16, b: u16, carry: bool) -> Self {
        let (sa, sb) = signed(width, a, b);
        let c = carry as u32;
        let (ua, ub) = (a as u32, b as u32);
        Self::latch(width, sa + sb + c as i32, ua + ub + c)
    }

    /// Scratch after `a - b` (minus `borrow`) at `width` bytes.
    pub fn sub(width: u8, a: u16, b: u16, borrow: bool) -> Self {
        let (sa, sb) = signed(width, a, b);
        let c = borrow as u32;
        let (ua, ub) = (a as u32, b as u32);
        Self::latch(width, sa - sb - c as i32, ua.wrapping_sub(ub).wrapping_sub(c))
    }

    /// Scratch after a logic operation producing `value`.
    pub fn logic(width: u8, value: u16) -> Self {
        let (s, _) = signed(width, value, 0);
        Self::latch(width, s, mask(width, value) as u32)
    }

    /// Zero.
    pub fn zf(&self) -> bool {
        self.ures & RESULT_MASK == 0
    }

    pub fn sf(&self) -> bool {
        self.ures & SIGN_BIT != 0
    }

    /// Carry out of the top bit.
    pub fn cf(&self) -> bool {
        self.ures & CARRY_BIT != 0
    }

    /// Signed result did not fit.
    pub fn of(&self) -> bool {
        self.sres < i16::MIN as i32 || self.sres > i16::MAX as i32
    }

    /// Evaluate a branch condition; `None` for parity.
    pub fn condition(&self, cond: Condition) -> Option<bool> {
        let (zf, sf, cf, of) = (self.zf(), self.sf(), self.cf(), self.of());
        let taken = match cond {
            Condition::Overflow => of,
            Condition::NoOverflow => !of,
            Condition::Below => cf,
            Condition::AboveOrEqual => !cf,
            Condition::Equal => zf,
            Condition::NotEqual => !zf,
            Condition::BelowOrEqual => cf || zf,
            Condition::Above => !cf && !zf,
            Condition::Sign => sf,
            Condition::NoSign => !sf,
            Condition::Less => sf != of,
            Condition::GreaterOrEqual => sf == of,
            Condition::LessOrEqual => zf || sf != of,
            Condition::Greater => !zf && sf == of,
            Condition::Parity | Condition::NoParity => return None,
        };
        Some(taken)
    }

    /// Pack into a FLAGS word (arithmetic flags only).
    pub fn flags(&self) -> u16 {
        let mut f = 0x0002;
        if self.cf() {
            f |= CARRY;
        }
        if self.zf() {
            f |= ZERO;
        }
        if self.sf() {
            f |= SIGN;
        }
        if self.of() {
            f |= OVERFLOW;
        }
        f
    }

    /// Unpack a FLAGS word. ZF wins when both ZF and SF are set.
    pub fn from_flags(f: u16) -> Self {
        let low = if f & ZERO != 0 {
            0
        } else if f & SIGN != 0 {
            0x8000
        } else {
            1
        };
        Self {
            ures: (((f & CARRY) as u32) << 16) | low,
            sres: if f & OVERFLOW != 0 { 0x8000 } else { 0 },
        }
    }
}

fn mask(width: u8, v: u16) -> u16 {
    if width == 1 {
        v & 0xff
    } else {
        v
    }
}

fn signed(width: u8, a: u16, b: u16) -> (i32, i32) {
    if width == 1 {
        (a as u8 as i8 as i32, b as u8 as i8 as i32)
    } else {
        (a as i16 as i32, b as i16 as i32)
    }
}
