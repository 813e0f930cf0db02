//! Expression AST.

use serde_json::Value;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `==` (also `===`)
    Eq,
    /// `!=` (also `!==`)
    Ne,
    /// `<`
    Lt,
    /// `>`
    Gt,
    /// `<=`
    Le,
    /// `>=`
    Ge,
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let symbol = match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
        };
        f.write_str(symbol)
    }
}

/// A parsed expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal int, float, string, or bool.
    Literal(Value),
    /// A `${path}` variable reference.
    VarRef(String),
    /// A bare identifier, treated as a variable reference.
    Ident(String),
    /// Logical negation; right-associative.
    Not(Box<Expr>),
    /// Logical conjunction; the right side is not evaluated when the left
    /// side is false.
    And(Box<Expr>, Box<Expr>),
    /// Logical disjunction; the right side is not evaluated when the left
    /// side is true.
    Or(Box<Expr>, Box<Expr>),
    /// A typed comparison.
    Compare {
        /// The operator.
        op: CompareOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_op_display() {
        assert_eq!(CompareOp::Eq.to_string(), "==");
        assert_eq!(CompareOp::Ne.to_string(), "!=");
        assert_eq!(CompareOp::Le.to_string(), "<=");
        assert_eq!(CompareOp::Ge.to_string(), ">=");
        assert_eq!(CompareOp::Lt.to_string(), "<");
        assert_eq!(CompareOp::Gt.to_string(), ">");
    }
}
