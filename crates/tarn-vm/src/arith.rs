//! Arithmetic operations with Lua 5.4 semantics.

use crate::coerce;
use crate::error::LuaError;
use tarn_bytecode::OpCode;
use tarn_core::string::StringInterner;
use tarn_core::value::{Number, Value};

/// Result of an arithmetic operation that may need a metamethod fallback.
pub enum ArithResult {
    /// Operation succeeded with this value.
    Ok(Value),
    /// Type mismatch: the caller should try a metamethod.
    NeedMetamethod,
    /// Actual error (e.g. integer division by zero).
    Error(LuaError),
}

/// Binary arithmetic and bitwise operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    IDiv,
    Pow,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
}

impl ArithOp {
    pub fn from_opcode(op: OpCode) -> Option<ArithOp> {
        Some(match op {
            OpCode::Add => ArithOp::Add,
            OpCode::Sub => ArithOp::Sub,
            OpCode::Mul => ArithOp::Mul,
            OpCode::Div => ArithOp::Div,
            OpCode::Mod => ArithOp::Mod,
            OpCode::FloorDiv => ArithOp::IDiv,
            OpCode::Power => ArithOp::Pow,
            OpCode::BitAnd => ArithOp::BAnd,
            OpCode::BitOr => ArithOp::BOr,
            OpCode::BitXor => ArithOp::BXor,
            OpCode::ShiftLeft => ArithOp::Shl,
            OpCode::ShiftRight => ArithOp::Shr,
            _ => return None,
        })
    }

    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr
        )
    }
}

/// Perform a binary arithmetic or bitwise operation.
/// Returns `ArithResult::NeedMetamethod` on type mismatch instead of erroring.
pub fn arith_op(op: ArithOp, a: &Value, b: &Value, strings: &StringInterner) -> ArithResult {
    if op.is_bitwise() {
        return bitwise_op(op, a, b, strings);
    }
    let (na, nb) = match (
        coerce::to_number(a, strings),
        coerce::to_number(b, strings),
    ) {
        (Some(na), Some(nb)) => (na, nb),
        _ => return ArithResult::NeedMetamethod,
    };
    match (na, nb, op) {
        (_, _, ArithOp::Div | ArithOp::Pow) => {
            ArithResult::Ok(Value::float(float_arith(op, na.as_f64(), nb.as_f64())))
        }
        (Number::Integer(ia), Number::Integer(ib), _) => match int_arith(op, ia, ib) {
            Ok(i) => ArithResult::Ok(Value::integer(i)),
            Err(e) => ArithResult::Error(e),
        },
        _ => ArithResult::Ok(Value::float(float_arith(op, na.as_f64(), nb.as_f64()))),
    }
}

/// Integer arithmetic.
fn int_arith(op: ArithOp, a: i64, b: i64) -> Result<i64, LuaError> {
    Ok(match op {
        ArithOp::Add => a.wrapping_add(b),
        ArithOp::Sub => a.wrapping_sub(b),
        ArithOp::Mul => a.wrapping_mul(b),
        ArithOp::IDiv => {
            if b == 0 {
                return Err(LuaError::runtime("attempt to perform 'n//0'"));
            }
            lua_idiv(a, b)
        }
        ArithOp::Mod => {
            if b == 0 {
                return Err(LuaError::runtime("attempt to perform 'n%0'"));
            }
            lua_imod(a, b)
        }
        ArithOp::BAnd => a & b,
        ArithOp::BOr => a | b,
        ArithOp::BXor => a ^ b,
        ArithOp::Shl => lua_shl(a, b),
        ArithOp::Shr => lua_shr(a, b),
        ArithOp::Div | ArithOp::Pow => {
            return Err(LuaError::internal("float operator on the integer path"))
        }
    })
}

/// Float arithmetic. Division and modulo by zero follow IEEE 754.
fn float_arith(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Pow => a.powf(b),
        ArithOp::IDiv => (a / b).floor(),
        ArithOp::Mod => lua_fmod(a, b),
        ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr => f64::NAN,
    }
}

/// Lua integer division (floor division).
fn lua_idiv(a: i64, b: i64) -> i64 {
    // wrapping_div handles i64::MIN / -1
    let d = a.wrapping_div(b);
    let r = a.wrapping_rem(b);
    if r != 0 && (r ^ b) < 0 {
        d - 1
    } else {
        d
    }
}

/// Lua integer modulo.
fn lua_imod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && (r ^ b) < 0 {
        r.wrapping_add(b)
    } else {
        r
    }
}

/// Lua float modulo: a - floor(a/b)*b.
fn lua_fmod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && ((r > 0.0) != (b > 0.0)) {
        r + b
    } else {
        r
    }
}

/// Lua left shift.
fn lua_shl(a: i64, b: i64) -> i64 {
    if b >= 64 || b <= -64 {
        0
    } else if b < 0 {
        lua_shr(a, -b)
    } else {
        (a as u64).wrapping_shl(b as u32) as i64
    }
}

/// Lua right shift (logical).
fn lua_shr(a: i64, b: i64) -> i64 {
    if b >= 64 || b <= -64 {
        0
    } else if b < 0 {
        lua_shl(a, -b)
    } else {
        (a as u64).wrapping_shr(b as u32) as i64
    }
}

/// Bitwise operators need integer operands. Numbers without an integer
/// representation are an error, anything non-numeric goes to metamethods.
fn bitwise_op(op: ArithOp, a: &Value, b: &Value, strings: &StringInterner) -> ArithResult {
    let (na, nb) = match (
        coerce::to_number(a, strings),
        coerce::to_number(b, strings),
    ) {
        (Some(na), Some(nb)) => (na, nb),
        _ => return ArithResult::NeedMetamethod,
    };
    match (na.to_integer(), nb.to_integer()) {
        (Some(ia), Some(ib)) => match int_arith(op, ia, ib) {
            Ok(i) => ArithResult::Ok(Value::integer(i)),
            Err(e) => ArithResult::Error(e),
        },
        _ => ArithResult::Error(LuaError::no_integer_representation()),
    }
}

/// Unary minus.
pub fn arith_unm(v: &Value, strings: &StringInterner) -> ArithResult {
    match coerce::to_number(v, strings) {
        Some(Number::Integer(i)) => ArithResult::Ok(Value::integer(i.wrapping_neg())),
        Some(Number::Float(f)) => ArithResult::Ok(Value::float(-f)),
        None => ArithResult::NeedMetamethod,
    }
}

/// Bitwise NOT.
pub fn arith_bnot(v: &Value, strings: &StringInterner) -> ArithResult {
    match coerce::to_number(v, strings) {
        Some(n) => match n.to_integer() {
            Some(i) => ArithResult::Ok(Value::integer(!i)),
            None => ArithResult::Error(LuaError::no_integer_representation()),
        },
        None => ArithResult::NeedMetamethod,
    }
}

/// Numeric `for` step: `value + step`, keeping integers integral.
pub fn for_increment(value: Number, step: Number) -> Number {
    match (value, step) {
        (Number::Integer(a), Number::Integer(b)) => Number::Integer(a.wrapping_add(b)),
        (a, b) => Number::Float(a.as_f64() + b.as_f64()),
    }
}
