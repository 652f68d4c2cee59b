//! Per-opcode C emitters. One call produces one logical statement.

use crate::instruction::{Instruction, Opcode, Repeat, StringOp};
use crate::operand::{render_literal, Operand, Reg, Site};
use crate::{Address, TranslateError};

use super::flags::condition_expr;

fn uty(width: u8) -> &'static str {
    if width == 1 {
        "uint8_t"
    } else {
        "uint16_t"
    }
}

fn sty(width: u8) -> &'static str {
    if width == 1 {
        "int8_t"
    } else {
        "int16_t"
    }
}

fn latch(width: u8) -> &'static str {
    if width == 1 {
        "LATCH8"
    } else {
        "LATCH16"
    }
}

fn bits(width: u8) -> u32 {
    width as u32 * 8
}

fn mask(width: u8) -> &'static str {
    if width == 1 {
        "0xFFu"
    } else {
        "0xFFFFu"
    }
}

fn arity<'i>(insn: &'i Instruction, site: &Site<'_>, n: usize) -> Result<&'i [Operand], TranslateError> {
    if insn.operands.len() != n {
        return Err(site.codegen(format!(
            "`{}` expects {} operands, found {}",
            insn.opcode,
            n,
            insn.operands.len()
        )));
    }
    Ok(&insn.operands)
}

fn target(insn: &Instruction, site: &Site<'_>) -> Result<Address, TranslateError> {
    insn.target()
        .ok_or_else(|| site.codegen("branch target is not known statically"))
}

/// Emit `insn` as C.
pub fn instruction(insn: &Instruction) -> Result<String, TranslateError> {
    let site = insn.site();
    let site = &site;
    match &insn.opcode {
        Opcode::Mov => {
            let ops = arity(insn, site, 2)?;
            Ok(format!("{} = {};", ops[0].render(site)?, ops[1].render(site)?))
        }
        Opcode::Xchg => {
            let ops = arity(insn, site, 2)?;
            let w = ops[0].value_width(site)?;
            let (a, b) = (ops[0].render(site)?, ops[1].render(site)?);
            Ok(format!("{{ {} t = {}; {} = {}; {} = t; }}", uty(w), a, a, b, b))
        }
        Opcode::Lea => {
            let ops = arity(insn, site, 2)?;
            match &ops[1] {
                Operand::Indirect(ind) => Ok(format!(
                    "{} = {};",
                    ops[0].render(site)?,
                    ind.offset_expr(0, site)?
                )),
                _ => Err(site.codegen("lea needs a memory operand")),
            }
        }
        Opcode::Les => load_far_pointer(insn, site, Reg::Es),
        Opcode::Lds => load_far_pointer(insn, site, Reg::Ds),
        Opcode::Push => {
            let ops = arity(insn, site, 1)?;
            if ops[0].value_width(site)? != 2 {
                return Err(site.codegen("push needs a word operand"));
            }
            Ok(format!("push16(&r, {});", ops[0].render(site)?))
        }
        Opcode::Pop => {
            let ops = arity(insn, site, 1)?;
            if ops[0].value_width(site)? != 2 {
                return Err(site.codegen("pop needs a word operand"));
            }
            Ok(format!("{} = pop16(&r);", ops[0].render(site)?))
        }
        Opcode::Pushf => Ok("push16(&r, flags_get(&r));".into()),
        Opcode::Popf => Ok("flags_set(&r, pop16(&r));".into()),

        Opcode::Add => arith(insn, site, '+', false, true),
        Opcode::Adc => arith(insn, site, '+', true, true),
        Opcode::Sub => arith(insn, site, '-', false, true),
        Opcode::Sbb => arith(insn, site, '-', true, true),
        Opcode::Cmp => arith(insn, site, '-', false, false),
        Opcode::And => logic(insn, site, '&', true),
        Opcode::Or => logic(insn, site, '|', true),
        Opcode::Xor => logic(insn, site, '^', true),
        Opcode::Test => logic(insn, site, '&', false),
        Opcode::Inc => step(insn, site, '+'),
        Opcode::Dec => step(insn, site, '-'),
        Opcode::Neg => {
            let ops = arity(insn, site, 1)?;
            let w = ops[0].value_width(site)?;
            Ok(format!(
                "{{ uint32_t u = 0u - {du}; int32_t s = -(int32_t){ds}; {d} = ({t})u; {l}(s, u); }}",
                du = ops[0].render_wide(site)?,
                ds = ops[0].render_signed_as(w, site)?,
                d = ops[0].render(site)?,
                t = uty(w),
                l = latch(w)
            ))
        }
        Opcode::Not => {
            let ops = arity(insn, site, 1)?;
            let w = ops[0].value_width(site)?;
            let d = ops[0].render(site)?;
            Ok(format!("{} = ({})~{};", d, uty(w), d))
        }
        Opcode::Mul => multiply(insn, site, false),
        Opcode::Imul => multiply(insn, site, true),
        Opcode::Div => divide(insn, site, false),
        Opcode::Idiv => divide(insn, site, true),

        Opcode::Shl | Opcode::Shr | Opcode::Sar => shift(insn, site),
        Opcode::Rol | Opcode::Ror | Opcode::Rcl | Opcode::Rcr => rotate(insn, site),

        Opcode::Cbw => Ok("r.ax = (uint16_t)(int16_t)(int8_t)r.al;".into()),
        Opcode::Cwd => Ok("r.dx = (r.ax & 0x8000u) ? 0xFFFF : 0;".into()),
        Opcode::Lahf => Ok("r.ah = (uint8_t)flags_get(&r);".into()),
        Opcode::Sahf => Ok("flags_set(&r, (uint16_t)((flags_get(&r) & 0xFF00u) | r.ah));".into()),
        Opcode::Xlat => {
            let segment = insn
                .operands
                .iter()
                .find_map(|op| match op {
                    Operand::Indirect(ind) => Some(ind.segment),
                    _ => None,
                })
                .unwrap_or(Reg::Ds);
            Ok(format!(
                "r.al = m[((uint32_t)r.{} << 4) + (uint16_t)(r.bx + r.al)];",
                segment
            ))
        }
        Opcode::Clc => Ok("r.ures &= ~0x10000u;".into()),
        Opcode::Stc => Ok("r.ures |= 0x10000u;".into()),
        Opcode::Cmc => Ok("r.ures ^= 0x10000u;".into()),
        Opcode::Cld => Ok("r.df = 0;".into()),
        Opcode::Std => Ok("r.df = 1;".into()),
        Opcode::Cli => Ok("r.ifl = 0;".into()),
        Opcode::Sti => Ok("r.ifl = 1;".into()),
        Opcode::Nop => Ok(";".into()),
        Opcode::Hlt => Ok("cpu_halt(&r);".into()),
        Opcode::Int => {
            let ops = arity(insn, site, 1)?;
            let vector = ops[0]
                .as_literal()
                .ok_or_else(|| site.codegen("interrupt vector must be a literal"))?;
            Ok(format!("interrupt(&r, {});", render_literal(vector, 1)))
        }
        Opcode::In => {
            let ops = arity(insn, site, 2)?;
            let w = ops[0].value_width(site)?;
            Ok(format!(
                "{} = port_in{}({});",
                ops[0].render(site)?,
                bits(w),
                port(&ops[1], site)?
            ))
        }
        Opcode::Out => {
            let ops = arity(insn, site, 2)?;
            let w = ops[1].value_width(site)?;
            Ok(format!(
                "port_out{}({}, {});",
                bits(w),
                port(&ops[0], site)?,
                ops[1].render(site)?
            ))
        }

        Opcode::Call { far } => {
            let callee = target(insn, site)?;
            let ret = render_literal(insn.fall_through().offset(), 2);
            if *far {
                Ok(format!(
                    "push16(&r, r.cs); push16(&r, {}); r.cs = {}; {}(&r);",
                    ret,
                    render_literal(callee.segment(), 2),
                    callee.function_name()
                ))
            } else {
                Ok(format!("push16(&r, {}); {}(&r);", ret, callee.function_name()))
            }
        }
        Opcode::Jmp { far } => {
            let dest = target(insn, site)?;
            if *far {
                Ok(format!(
                    "r.cs = {}; goto {};",
                    render_literal(dest.segment(), 2),
                    dest.label()
                ))
            } else {
                Ok(format!("goto {};", dest.label()))
            }
        }
        Opcode::Ret => ret(insn, site, "(void)pop16(&r);"),
        Opcode::Retf => ret(insn, site, "(void)pop16(&r); r.cs = pop16(&r);"),
        Opcode::Iret => ret(
            insn,
            site,
            "(void)pop16(&r); r.cs = pop16(&r); flags_set(&r, pop16(&r));",
        ),
        Opcode::Jcc(cond) => {
            let expr = condition_expr(*cond).ok_or_else(|| TranslateError::UnimplementedOpcode {
                address: insn.address,
                opcode: insn.opcode.to_string(),
                line: insn.text.clone(),
            })?;
            Ok(format!("if ({}) goto {};", expr, target(insn, site)?.label()))
        }
        Opcode::Loop => Ok(format!("if (--r.cx != 0) goto {};", target(insn, site)?.label())),
        Opcode::Loope => Ok(format!(
            "if (--r.cx != 0 && ZF) goto {};",
            target(insn, site)?.label()
        )),
        Opcode::Loopne => Ok(format!(
            "if (--r.cx != 0 && !ZF) goto {};",
            target(insn, site)?.label()
        )),
        Opcode::Jcxz => Ok(format!("if (r.cx == 0) goto {};", target(insn, site)?.label())),

        Opcode::Str { op, width, repeat } => Ok(string_op(insn, *op, *width, *repeat)),

        Opcode::Unsupported(mnemonic) => Err(TranslateError::UnimplementedOpcode {
            address: insn.address,
            opcode: mnemonic.clone(),
            line: insn.text.clone(),
        }),
    }
}

fn port(op: &Operand, site: &Site<'_>) -> Result<String, TranslateError> {
    match op {
        Operand::Literal { value, .. } => Ok(render_literal(*value, 1)),
        Operand::Register(Reg::Dx) => Ok("r.dx".into()),
        _ => Err(site.codegen("port must be an immediate or dx")),
    }
}

fn ret(insn: &Instruction, site: &Site<'_>, pops: &str) -> Result<String, TranslateError> {
    let adjust = match insn.operands.as_slice() {
        [] => String::new(),
        [Operand::Literal { value, .. }] => format!(" r.sp += {};", render_literal(*value, 2)),
        _ => return Err(site.codegen("return takes at most one immediate")),
    };
    Ok(format!("{}{} *caller = r; return;", pops, adjust))
}

fn load_far_pointer(insn: &Instruction, site: &Site<'_>, segment: Reg) -> Result<String, TranslateError> {
    let ops = arity(insn, site, 2)?;
    let ind = match &ops[1] {
        Operand::Indirect(ind) => ind,
        _ => return Err(site.codegen("far pointer load needs a memory operand")),
    };
    Ok(format!(
        "{{ uint16_t o = *(uint16_t *)&m[{}]; uint16_t s = *(uint16_t *)&m[{}]; {} = o; r.{} = s; }}",
        ind.address_expr(0, site)?,
        ind.address_expr(2, site)?,
        ops[0].render(site)?,
        segment
    ))
}

fn arith(
    insn: &Instruction,
    site: &Site<'_>,
    op: char,
    carry: bool,
    store: bool,
) -> Result<String, TranslateError> {
    let ops = arity(insn, site, 2)?;
    let w = ops[0].value_width(site)?;
    let (uc, sc) = if carry {
        (format!(" {} CFV", op), format!(" {} (int32_t)CFV", op))
    } else {
        (String::new(), String::new())
    };
    let mut out = format!(
        "{{ uint32_t u = {du} {op} {su}{uc}; int32_t s = (int32_t){ds} {op} (int32_t){ss}{sc}; ",
        du = ops[0].render_wide(site)?,
        su = ops[1].render_wide(site)?,
        ds = ops[0].render_signed_as(w, site)?,
        ss = ops[1].render_signed_as(w, site)?,
        op = op,
        uc = uc,
        sc = sc
    );
    if store {
        out.push_str(&format!("{} = ({})u; ", ops[0].render(site)?, uty(w)));
    }
    out.push_str(&format!("{}(s, u); }}", latch(w)));
    Ok(out)
}

fn logic(insn: &Instruction, site: &Site<'_>, op: char, store: bool) -> Result<String, TranslateError> {
    let ops = arity(insn, site, 2)?;
    let w = ops[0].value_width(site)?;
    let (d, s) = (ops[0].render(site)?, ops[1].render(site)?);
    let mut out = format!("{{ {} v = {} {} {}; ", uty(w), d, op, s);
    if store {
        out.push_str(&format!("{} = v; ", d));
    }
    out.push_str(&format!("{}(({})v, v); }}", latch(w), sty(w)));
    Ok(out)
}

fn step(insn: &Instruction, site: &Site<'_>, op: char) -> Result<String, TranslateError> {
    let ops = arity(insn, site, 1)?;
    let w = ops[0].value_width(site)?;
    Ok(format!(
        "{{ uint32_t u = {du} {op} 1u; int32_t s = (int32_t){ds} {op} 1; {d} = ({t})u; LATCHNC{b}(s, u); }}",
        du = ops[0].render_wide(site)?,
        ds = ops[0].render_signed_as(w, site)?,
        d = ops[0].render(site)?,
        op = op,
        t = uty(w),
        b = bits(w)
    ))
}

fn multiply(insn: &Instruction, site: &Site<'_>, signed: bool) -> Result<String, TranslateError> {
    const LATCH_OVERFLOW: &str =
        "r.sres = o ? 0x8000 : 0; r.ures = (o ? 0x10000u : 0) | (uint32_t)";
    match (insn.operands.as_slice(), signed) {
        ([src], false) => {
            let w = src.value_width(site)?;
            let s = src.render(site)?;
            if w == 1 {
                Ok(format!(
                    "{{ uint16_t p = (uint16_t)(r.al * {}); int o = (p >> 8) != 0; r.ax = p; {}r.ax; }}",
                    s, LATCH_OVERFLOW
                ))
            } else {
                Ok(format!(
                    "{{ uint32_t p = (uint32_t)r.ax * {}; r.ax = (uint16_t)p; r.dx = (uint16_t)(p >> 16); int o = r.dx != 0; {}r.ax; }}",
                    s, LATCH_OVERFLOW
                ))
            }
        }
        ([src], true) => {
            let w = src.value_width(site)?;
            let s = src.render_signed(site)?;
            if w == 1 {
                Ok(format!(
                    "{{ int16_t p = (int16_t)((int8_t)r.al * {}); int o = p != (int8_t)p; r.ax = (uint16_t)p; {}r.ax; }}",
                    s, LATCH_OVERFLOW
                ))
            } else {
                Ok(format!(
                    "{{ int32_t p = (int32_t)(int16_t)r.ax * {}; int o = p != (int16_t)p; r.ax = (uint16_t)p; r.dx = (uint16_t)((uint32_t)p >> 16); {}r.ax; }}",
                    s, LATCH_OVERFLOW
                ))
            }
        }
        ([dest, a, b], true) => imul_into(dest, a, b, site, LATCH_OVERFLOW),
        ([dest, b], true) => imul_into(dest, dest, b, site, LATCH_OVERFLOW),
        _ => Err(site.codegen(format!(
            "`{}` with {} operands",
            insn.opcode,
            insn.operands.len()
        ))),
    }
}

fn imul_into(
    dest: &Operand,
    a: &Operand,
    b: &Operand,
    site: &Site<'_>,
    latch: &str,
) -> Result<String, TranslateError> {
    if dest.value_width(site)? != 2 {
        return Err(site.codegen("multi-operand imul needs a word destination"));
    }
    let d = dest.render(site)?;
    Ok(format!(
        "{{ int32_t p = (int32_t){} * (int32_t){}; int o = p != (int16_t)p; {} = (uint16_t)p; {}{}; }}",
        a.render_signed(site)?,
        b.render_signed(site)?,
        d,
        latch,
        d
    ))
}

fn divide(insn: &Instruction, site: &Site<'_>, signed: bool) -> Result<String, TranslateError> {
    let ops = arity(insn, site, 1)?;
    let w = ops[0].value_width(site)?;
    let fault = "interrupt(&r, 0);";
    let text = match (w, signed) {
        (1, false) => format!(
            "{{ uint16_t d = {}; if (d == 0) {{ {f} }} else {{ uint16_t n = r.ax; uint16_t q = n / d; if (q > 0xFF) {{ {f} }} else {{ r.al = (uint8_t)q; r.ah = (uint8_t)(n % d); }} }} }}",
            ops[0].render(site)?,
            f = fault
        ),
        (_, false) => format!(
            "{{ uint32_t d = {}; if (d == 0) {{ {f} }} else {{ uint32_t n = ((uint32_t)r.dx << 16) | r.ax; uint32_t q = n / d; if (q > 0xFFFF) {{ {f} }} else {{ r.ax = (uint16_t)q; r.dx = (uint16_t)(n % d); }} }} }}",
            ops[0].render(site)?,
            f = fault
        ),
        (1, true) => format!(
            "{{ int32_t d = {}; if (d == 0) {{ {f} }} else {{ int32_t n = (int16_t)r.ax; int32_t q = n / d; if (q < -128 || q > 127) {{ {f} }} else {{ r.al = (uint8_t)q; r.ah = (uint8_t)(n % d); }} }} }}",
            ops[0].render_signed(site)?,
            f = fault
        ),
        (_, true) => format!(
            "{{ int64_t d = {}; if (d == 0) {{ {f} }} else {{ int64_t n = (int32_t)(((uint32_t)r.dx << 16) | r.ax); int64_t q = n / d; if (q < -32768 || q > 32767) {{ {f} }} else {{ r.ax = (uint16_t)q; r.dx = (uint16_t)(n % d); }} }} }}",
            ops[0].render_signed(site)?,
            f = fault
        ),
    };
    Ok(text)
}

/// Shift count: the second operand, or 1 for the one-operand form.
fn count(insn: &Instruction, site: &Site<'_>) -> Result<(String, String), TranslateError> {
    match insn.operands.as_slice() {
        [dest] => Ok((dest.render(site)?, "1".into())),
        [dest, Operand::Literal { value, .. }] => Ok((dest.render(site)?, render_literal(*value, 1))),
        [dest, Operand::Register(Reg::Cl)] => Ok((dest.render(site)?, "r.cl".into())),
        _ => Err(site.codegen("shift count must be an immediate or cl")),
    }
}

fn shift(insn: &Instruction, site: &Site<'_>) -> Result<String, TranslateError> {
    let w = insn
        .operands
        .first()
        .ok_or_else(|| site.codegen("shift without operands"))?
        .value_width(site)?;
    let (d, n) = count(insn, site)?;
    let msb = if w == 1 { "0x80" } else { "0x8000" };
    let body = match insn.opcode {
        Opcode::Shl => format!(
            "uint32_t u = (uint32_t){d} << n; int32_t s = (int32_t)({st}){d} * 2; {d} = ({t})u; {l}(s, u);",
            d = d,
            st = sty(w),
            t = uty(w),
            l = latch(w)
        ),
        Opcode::Shr => format!(
            "{t} a = {d}; uint32_t u = ((uint32_t)a >> n) | ((((uint32_t)a >> (n - 1)) & 1u) << {b}); int32_t s = (a & {msb}) ? {msb} : 0; {d} = ({t})(a >> n); {l}(s, u);",
            d = d,
            t = uty(w),
            b = bits(w),
            msb = msb,
            l = latch(w)
        ),
        _ => format!(
            "int32_t a = ({st}){d}; int32_t v = a >> n; uint32_t u = ((uint32_t)v & {m}) | ((uint32_t)((a >> (n - 1)) & 1) << {b}); {d} = ({t})v; {l}(0, u);",
            d = d,
            st = sty(w),
            m = mask(w),
            b = bits(w),
            t = uty(w),
            l = latch(w)
        ),
    };
    Ok(format!("{{ unsigned n = {} & 0x1Fu; if (n) {{ {} }} }}", n, body))
}

fn rotate(insn: &Instruction, site: &Site<'_>) -> Result<String, TranslateError> {
    let w = insn
        .operands
        .first()
        .ok_or_else(|| site.codegen("rotate without operands"))?
        .value_width(site)?;
    let (d, n) = count(insn, site)?;
    let hb = bits(w) - 1;
    let m = mask(w);
    let (init, body) = match insn.opcode {
        Opcode::Rol => (
            "0",
            format!("c = (v >> {hb}) & 1u; v = ((v << 1) | c) & {m};", hb = hb, m = m),
        ),
        Opcode::Ror => ("0", format!("c = v & 1u; v = (v >> 1) | (c << {hb});", hb = hb)),
        Opcode::Rcl => (
            "CFV",
            format!(
                "uint32_t out = (v >> {hb}) & 1u; v = ((v << 1) | c) & {m}; c = out;",
                hb = hb,
                m = m
            ),
        ),
        _ => (
            "CFV",
            format!("uint32_t out = v & 1u; v = (v >> 1) | (c << {hb}); c = out;", hb = hb),
        ),
    };
    Ok(format!(
        "{{ unsigned n = {n} & 0x1Fu; if (n) {{ uint32_t v = {d}; uint32_t c = {init}; while (n--) {{ {body} }} {d} = ({t})v; SETCF(c); }} }}",
        n = n,
        d = d,
        init = init,
        body = body,
        t = uty(w)
    ))
}

fn memory(width: u8, addr: &str) -> String {
    if width == 1 {
        format!("m[{}]", addr)
    } else {
        format!("*(uint16_t *)&m[{}]", addr)
    }
}

fn string_op(insn: &Instruction, op: StringOp, width: u8, repeat: Option<Repeat>) -> String {
    // An explicit override applies to the ds:si side only.
    let source_segment = insn
        .operands
        .iter()
        .find_map(|o| match o {
            Operand::Indirect(ind) if ind.offsets.contains(&Operand::Register(Reg::Si)) => {
                Some(ind.segment)
            }
            _ => None,
        })
        .unwrap_or(Reg::Ds);
    let src = memory(width, &format!("((uint32_t)r.{} << 4) + r.si", source_segment));
    let dst = memory(width, "((uint32_t)r.es << 4) + r.di");
    let acc = if width == 1 { "r.al" } else { "r.ax" };
    let back = if width == 1 { "0xFFFF" } else { "0xFFFE" };
    let step_si = format!("r.si += r.df ? {} : {};", back, width);
    let step_di = format!("r.di += r.df ? {} : {};", back, width);
    let compare = |a: &str, b: &str| {
        format!(
            "{{ uint32_t u = (uint32_t){a} - (uint32_t){b}; int32_t s = (int32_t)({st}){a} - (int32_t)({st}){b}; {l}(s, u); }}",
            a = a,
            b = b,
            st = sty(width),
            l = latch(width)
        )
    };

    let (body, compares) = match op {
        StringOp::Movs => (format!("{} = {}; {} {}", dst, src, step_si, step_di), false),
        StringOp::Lods => (format!("{} = {}; {}", acc, src, step_si), false),
        StringOp::Stos => (format!("{} = {}; {}", dst, acc, step_di), false),
        StringOp::Cmps => (format!("{} {} {}", compare(&src, &dst), step_si, step_di), true),
        StringOp::Scas => (format!("{} {}", compare(acc, &dst), step_di), true),
    };

    match repeat {
        None => format!("{{ {} }}", body),
        Some(rep) => {
            let stop = match (rep, compares) {
                (Repeat::Repe, true) => " if (!ZF) break;",
                (Repeat::Repne, true) => " if (ZF) break;",
                _ => "",
            };
            format!("while (r.cx != 0) {{ {} r.cx--;{} }}", body, stop)
        }
    }
}
