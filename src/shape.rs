//! Vector shape lattice.
//!
//! A shape characterizes how a value is distributed over the lanes of a SIMD
//! group:
//!
//! ```text
//!        Undef (bottom)
//!          |
//!        Uniform              identical across lanes
//!          |
//!     Contiguous(s, a)        lane i holds base + s*i, exactly
//!          |
//!      Strided(s, a)          stride s known, lane values may deviate
//!          |
//!       Varying(a) (top)      arbitrary per lane
//! ```
//!
//! Shapes only rise along this chain, which is finite, so the fixed-point
//! solver terminates. `meet` is the least upper bound; `join` the greatest
//! lower bound.
//!
//! # Alignment algebra
//!
//! `align` is the known divisor of the base lane value, with `0` playing the
//! role of "exactly zero" (the gcd identity): `gcd(0, x) = x`, so a base of
//! literally 0 combines losslessly. Alignment of a sum is the gcd of the
//! operand alignments; alignment of a scaled value multiplies, saturating to
//! 1 (no information) on overflow.

use std::fmt;

// =============================================================================
// VectorShape
// =============================================================================

/// Lane-distribution characterization of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VectorShape {
    /// No information yet (bottom).
    Undef,

    /// Identical across all lanes.
    Uniform,

    /// Lane `i` holds exactly `base + stride * i`.
    Contiguous { stride: i64, align: u64 },

    /// Stride is known but lane values may deviate from the exact affine
    /// sequence (enters through argument annotations; sticky).
    Strided { stride: i64, align: u64 },

    /// Arbitrary per lane (top).
    Varying { align: u64 },
}

use VectorShape::*;

impl VectorShape {
    /// Bottom element.
    #[inline]
    pub fn undef() -> Self {
        Undef
    }

    /// Uniform shape.
    #[inline]
    pub fn uni() -> Self {
        Uniform
    }

    /// Exact affine shape.
    #[inline]
    pub fn cont(stride: i64, align: u64) -> Self {
        Contiguous { stride, align }
    }

    /// Inexact affine shape.
    #[inline]
    pub fn strided(stride: i64, align: u64) -> Self {
        Strided { stride, align }
    }

    /// Top element with alignment info.
    #[inline]
    pub fn varying(align: u64) -> Self {
        Varying { align }
    }

    /// Check for the bottom element.
    #[inline]
    pub fn is_undef(&self) -> bool {
        matches!(self, Undef)
    }

    /// Check for the uniform shape.
    #[inline]
    pub fn is_uniform(&self) -> bool {
        matches!(self, Uniform)
    }

    /// Check for the top element.
    #[inline]
    pub fn is_varying(&self) -> bool {
        matches!(self, Varying { .. })
    }

    /// Check that the shape carries any information (not bottom).
    #[inline]
    pub fn is_defined(&self) -> bool {
        !self.is_undef()
    }

    /// The constant per-lane stride, if the shape has one. Uniform values
    /// have stride 0.
    pub fn stride(&self) -> Option<i64> {
        match *self {
            Uniform => Some(0),
            Contiguous { stride, .. } | Strided { stride, .. } => Some(stride),
            _ => None,
        }
    }

    /// Base alignment carried by the shape (1 = no information).
    pub fn alignment(&self) -> u64 {
        match *self {
            Contiguous { align, .. } | Strided { align, .. } | Varying { align } => align,
            Uniform | Undef => 1,
        }
    }

    /// Whether the affine sequence is exact.
    pub fn is_exact_affine(&self) -> bool {
        matches!(self, Uniform | Contiguous { .. })
    }

    /// Least upper bound along the lattice chain.
    pub fn meet(&self, other: &Self) -> Self {
        match (*self, *other) {
            // Bottom element is the identity.
            (Undef, x) | (x, Undef) => x,

            // Top element absorbs, keeping the common alignment.
            (Varying { align: a }, x) | (x, Varying { align: a }) => {
                Varying {
                    align: align_gcd(a, x.alignment()),
                }
            }

            (Uniform, Uniform) => Uniform,

            // Uniform sits below every stride-carrying shape.
            (Uniform, x) | (x, Uniform) => x,

            (Contiguous { stride: s1, align: a1 }, Contiguous { stride: s2, align: a2 }) => {
                if s1 == s2 {
                    Contiguous {
                        stride: s1,
                        align: align_gcd(a1, a2),
                    }
                } else {
                    Varying {
                        align: align_gcd(a1, a2),
                    }
                }
            }

            (Contiguous { stride: s1, align: a1 }, Strided { stride: s2, align: a2 })
            | (Strided { stride: s1, align: a1 }, Contiguous { stride: s2, align: a2 })
            | (Strided { stride: s1, align: a1 }, Strided { stride: s2, align: a2 }) => {
                if s1 == s2 {
                    Strided {
                        stride: s1,
                        align: align_gcd(a1, a2),
                    }
                } else {
                    Varying {
                        align: align_gcd(a1, a2),
                    }
                }
            }
        }
    }

    /// Greatest lower bound along the lattice chain.
    pub fn join(&self, other: &Self) -> Self {
        match (*self, *other) {
            (Undef, _) | (_, Undef) => Undef,
            (Varying { align: a }, x) | (x, Varying { align: a }) => match x {
                Varying { align: b } => Varying {
                    align: align_gcd(a, b),
                },
                _ => x,
            },
            (Uniform, _) | (_, Uniform) => Uniform,
            (Contiguous { stride: s1, align: a1 }, Contiguous { stride: s2, align: a2 })
            | (Contiguous { stride: s1, align: a1 }, Strided { stride: s2, align: a2 })
            | (Strided { stride: s1, align: a1 }, Contiguous { stride: s2, align: a2 }) => {
                if s1 == s2 {
                    Contiguous {
                        stride: s1,
                        align: align_gcd(a1, a2),
                    }
                } else {
                    Uniform
                }
            }
            (Strided { stride: s1, align: a1 }, Strided { stride: s2, align: a2 }) => {
                if s1 == s2 {
                    Strided {
                        stride: s1,
                        align: align_gcd(a1, a2),
                    }
                } else {
                    Uniform
                }
            }
        }
    }

    /// Partial order: `self` is at or below `other` on the chain.
    pub fn le(&self, other: &Self) -> bool {
        self.meet(other) == *other
    }

    /// Merge another shape into this one (in-place meet).
    ///
    /// Returns true if `self` changed.
    pub fn merge(&mut self, other: &Self) -> bool {
        let new = self.meet(other);
        debug_assert_eq!(
            new.meet(self),
            new,
            "expected `meet` to be monotonic"
        );
        if new != *self {
            *self = new;
            true
        } else {
            false
        }
    }
}

impl Default for VectorShape {
    fn default() -> Self {
        Undef
    }
}

impl fmt::Display for VectorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Undef => write!(f, "undef"),
            Uniform => write!(f, "uni"),
            Contiguous { stride, align } => write!(f, "cont({stride}, {align})"),
            Strided { stride, align } => write!(f, "stride({stride}, {align})"),
            Varying { align } => write!(f, "varying({align})"),
        }
    }
}

// =============================================================================
// Alignment arithmetic
// =============================================================================

/// Alignment of a sum: gcd with 0 as the identity.
pub fn align_gcd(a: u64, b: u64) -> u64 {
    if a == 0 {
        return b;
    }
    if b == 0 {
        return a;
    }
    let (mut a, mut b) = (a, b);
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

/// Alignment of a scaled value; 1 (no information) on overflow.
pub fn align_mul(a: u64, factor: u64) -> u64 {
    if a == 0 || factor == 0 {
        return 0;
    }
    a.checked_mul(factor).unwrap_or(1)
}

// =============================================================================
// Arithmetic transfers
// =============================================================================

/// Operand view for the transfer functions: the operand's shape, plus its
/// literal value when the operand is a compile-time constant.
#[derive(Debug, Clone, Copy)]
pub struct ShapeTerm {
    pub shape: VectorShape,
    pub constant: Option<i64>,
}

impl ShapeTerm {
    pub fn new(shape: VectorShape, constant: Option<i64>) -> Self {
        ShapeTerm { shape, constant }
    }

    /// Base alignment including constant knowledge: a literal `c` has base
    /// exactly `c`.
    fn base_align(&self) -> u64 {
        match self.constant {
            Some(c) => c.unsigned_abs(),
            None => self.shape.alignment(),
        }
    }

    fn stride(&self) -> Option<i64> {
        self.shape.stride()
    }
}

/// Rebuild an affine shape, normalizing stride 0 with exactness to uniform
/// only when no alignment information would be lost.
fn affine(stride: i64, align: u64, exact: bool) -> VectorShape {
    if exact {
        VectorShape::cont(stride, align)
    } else {
        VectorShape::strided(stride, align)
    }
}

/// Addition: strides add, alignments gcd.
pub fn transfer_add(a: ShapeTerm, b: ShapeTerm) -> VectorShape {
    transfer_add_scaled(a, b, 1)
}

/// Subtraction: strides subtract, alignments gcd.
pub fn transfer_sub(a: ShapeTerm, b: ShapeTerm) -> VectorShape {
    transfer_add_scaled(a, b, -1)
}

/// `a + factor * b` over the stride algebra (shared by add/sub/gep).
fn transfer_add_scaled(a: ShapeTerm, b: ShapeTerm, factor: i64) -> VectorShape {
    if a.shape.is_undef() || b.shape.is_undef() {
        return VectorShape::undef();
    }
    if a.shape.is_uniform() && b.shape.is_uniform() {
        return VectorShape::uni();
    }
    let (Some(sa), Some(sb)) = (a.stride(), b.stride()) else {
        return VectorShape::varying(align_gcd(a.base_align(), b.base_align()));
    };
    let align = align_gcd(a.base_align(), b.base_align());
    match sb.checked_mul(factor).and_then(|s| sa.checked_add(s)) {
        Some(stride) => affine(
            stride,
            align,
            a.shape.is_exact_affine() && b.shape.is_exact_affine(),
        ),
        None => VectorShape::varying(align),
    }
}

/// Multiplication: scaling by a uniform constant preserves affinity;
/// anything else only stays uniform when both operands are.
pub fn transfer_mul(a: ShapeTerm, b: ShapeTerm) -> VectorShape {
    if a.shape.is_undef() || b.shape.is_undef() {
        return VectorShape::undef();
    }
    if a.shape.is_uniform() && b.shape.is_uniform() {
        return VectorShape::uni();
    }
    // Order the constant scale first if present.
    let (scale, term) = match (a.constant, b.constant) {
        (Some(c), _) => (Some(c), b),
        (_, Some(c)) => (Some(c), a),
        _ => (None, a),
    };
    match (scale, term.stride()) {
        (Some(c), Some(s)) => match s.checked_mul(c) {
            Some(stride) => affine(
                stride,
                align_mul(term.base_align(), c.unsigned_abs()),
                term.shape.is_exact_affine(),
            ),
            None => VectorShape::varying(1),
        },
        _ => VectorShape::varying(1),
    }
}

/// Left shift by a uniform constant is a multiplication by a power of two.
pub fn transfer_shl(a: ShapeTerm, b: ShapeTerm) -> VectorShape {
    if a.shape.is_undef() || b.shape.is_undef() {
        return VectorShape::undef();
    }
    match b.constant {
        Some(c) if (0..63).contains(&c) => {
            transfer_mul(a, ShapeTerm::new(VectorShape::uni(), Some(1i64 << c)))
        }
        _ if a.shape.is_uniform() && b.shape.is_uniform() => VectorShape::uni(),
        _ => VectorShape::varying(1),
    }
}

/// Division and arithmetic right shift: only exact divisions of stride and
/// alignment survive; division by a literal zero collapses to varying.
pub fn transfer_sdiv(a: ShapeTerm, b: ShapeTerm) -> VectorShape {
    if a.shape.is_undef() || b.shape.is_undef() {
        return VectorShape::undef();
    }
    match b.constant {
        Some(0) => VectorShape::varying(1),
        Some(c) => {
            if a.shape.is_uniform() {
                return VectorShape::uni();
            }
            let Some(s) = a.stride() else {
                return VectorShape::varying(1);
            };
            let align = a.shape.alignment();
            if s % c == 0 && align % c.unsigned_abs() == 0 {
                affine(s / c, align / c.unsigned_abs(), a.shape.is_exact_affine())
            } else {
                VectorShape::varying(1)
            }
        }
        None if a.shape.is_uniform() && b.shape.is_uniform() => VectorShape::uni(),
        None => VectorShape::varying(1),
    }
}

/// Generic transfer for remainder, comparisons and boolean logic: uniform
/// when all operands are, varying otherwise.
pub fn transfer_generic(operands: &[ShapeTerm]) -> VectorShape {
    if operands.iter().any(|t| t.shape.is_undef()) {
        return VectorShape::undef();
    }
    if operands.iter().all(|t| t.shape.is_uniform()) {
        VectorShape::uni()
    } else {
        VectorShape::varying(1)
    }
}

/// Widening casts preserve the lane pattern.
pub fn transfer_ext(a: ShapeTerm) -> VectorShape {
    a.shape
}

/// Truncation collapses to varying unless provably uniform.
pub fn transfer_trunc(a: ShapeTerm) -> VectorShape {
    match a.shape {
        Undef => Undef,
        Uniform => Uniform,
        other => VectorShape::varying(other.alignment()),
    }
}

/// Pointer arithmetic `base + index * elem_size` over the stride algebra.
pub fn transfer_gep(base: ShapeTerm, index: ShapeTerm, elem_size: u64) -> VectorShape {
    if elem_size > i64::MAX as u64 {
        return VectorShape::varying(1);
    }
    transfer_add(
        base,
        ShapeTerm::new(
            transfer_mul(index, ShapeTerm::new(VectorShape::uni(), Some(elem_size as i64))),
            None,
        ),
    )
}

/// Select: with a uniform condition the result merges the two inputs;
/// a per-lane condition mixes them arbitrarily.
pub fn transfer_select(cond: ShapeTerm, on_true: ShapeTerm, on_false: ShapeTerm) -> VectorShape {
    if cond.shape.is_undef() || on_true.shape.is_undef() || on_false.shape.is_undef() {
        return VectorShape::undef();
    }
    if cond.shape.is_uniform() {
        on_true.shape.meet(&on_false.shape)
    } else {
        VectorShape::varying(align_gcd(
            on_true.shape.alignment(),
            on_false.shape.alignment(),
        ))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn term(shape: VectorShape) -> ShapeTerm {
        ShapeTerm::new(shape, None)
    }

    fn lit(c: i64) -> ShapeTerm {
        ShapeTerm::new(VectorShape::uni(), Some(c))
    }

    const SAMPLES: [VectorShape; 7] = [
        Undef,
        Uniform,
        Contiguous { stride: 1, align: 0 },
        Contiguous { stride: 2, align: 4 },
        Strided { stride: 2, align: 8 },
        Strided { stride: 3, align: 1 },
        Varying { align: 4 },
    ];

    // =========================================================================
    // Lattice laws
    // =========================================================================

    #[test]
    fn test_meet_idempotent() {
        for s in SAMPLES {
            assert_eq!(s.meet(&s), s);
        }
    }

    #[test]
    fn test_meet_commutative() {
        for a in SAMPLES {
            for b in SAMPLES {
                assert_eq!(a.meet(&b), b.meet(&a));
            }
        }
    }

    #[test]
    fn test_meet_is_upper_bound() {
        for a in SAMPLES {
            for b in SAMPLES {
                let m = a.meet(&b);
                assert!(a.le(&m), "{a} not <= meet({a}, {b}) = {m}");
                assert!(b.le(&m), "{b} not <= meet({a}, {b}) = {m}");
            }
        }
    }

    #[test]
    fn test_join_is_lower_bound() {
        for a in SAMPLES {
            for b in SAMPLES {
                let j = a.join(&b);
                assert!(j.le(&a));
                assert!(j.le(&b));
            }
        }
    }

    #[test]
    fn test_chain_order() {
        let cont = VectorShape::cont(2, 4);
        let strided = VectorShape::strided(2, 4);
        assert!(VectorShape::undef().le(&VectorShape::uni()));
        assert!(VectorShape::uni().le(&cont));
        assert!(cont.le(&strided));
        assert!(strided.le(&VectorShape::varying(4)));
    }

    #[test]
    fn test_meet_different_strides_varies() {
        let a = VectorShape::cont(1, 4);
        let b = VectorShape::cont(2, 6);
        assert_eq!(a.meet(&b), VectorShape::varying(2));
    }

    #[test]
    fn test_merge_reports_change() {
        let mut s = VectorShape::undef();
        assert!(s.merge(&VectorShape::uni()));
        assert!(!s.merge(&VectorShape::uni()));
        assert!(s.merge(&VectorShape::cont(1, 0)));
        assert_eq!(s, VectorShape::cont(1, 0));
    }

    // =========================================================================
    // Alignment arithmetic
    // =========================================================================

    #[test]
    fn test_align_gcd_zero_identity() {
        assert_eq!(align_gcd(0, 7), 7);
        assert_eq!(align_gcd(12, 0), 12);
        assert_eq!(align_gcd(12, 8), 4);
    }

    #[test]
    fn test_align_mul_overflow() {
        assert_eq!(align_mul(4, 2), 8);
        assert_eq!(align_mul(0, 9), 0);
        assert_eq!(align_mul(u64::MAX, 2), 1);
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    #[test]
    fn test_strided_contiguous_arithmetic() {
        // t = 2*i + 1, u = t + i with i contiguous(1, 0)
        let i = VectorShape::cont(1, 0);
        let t = transfer_add(
            ShapeTerm::new(transfer_mul(lit(2), term(i)), None),
            lit(1),
        );
        assert_eq!(t, VectorShape::cont(2, 1));
        let u = transfer_add(ShapeTerm::new(t, None), term(i));
        assert_eq!(u, VectorShape::cont(3, 1));
    }

    #[test]
    fn test_add_uniform_keeps_stride() {
        let i = VectorShape::cont(1, 0);
        // Adding an unknown uniform keeps the stride, loses base alignment.
        let r = transfer_add(term(i), term(VectorShape::uni()));
        assert_eq!(r, VectorShape::cont(1, 1));
    }

    #[test]
    fn test_mul_varying_operand() {
        let r = transfer_mul(term(VectorShape::varying(4)), lit(2));
        assert!(r.is_varying());
    }

    #[test]
    fn test_mul_two_affine_varies() {
        let i = term(VectorShape::cont(1, 0));
        assert!(transfer_mul(i, i).is_varying());
    }

    #[test]
    fn test_shl_is_scaling() {
        let i = term(VectorShape::cont(1, 0));
        assert_eq!(transfer_shl(i, lit(3)), VectorShape::cont(8, 0));
    }

    #[test]
    fn test_sdiv_exact() {
        let a = term(VectorShape::cont(4, 8));
        assert_eq!(transfer_sdiv(a, lit(2)), VectorShape::cont(2, 4));
    }

    #[test]
    fn test_sdiv_inexact_varies() {
        let a = term(VectorShape::cont(3, 1));
        assert!(transfer_sdiv(a, lit(2)).is_varying());
    }

    #[test]
    fn test_sdiv_by_zero_varies() {
        let a = term(VectorShape::cont(4, 8));
        assert!(transfer_sdiv(a, lit(0)).is_varying());
    }

    #[test]
    fn test_strided_is_sticky() {
        let s = term(VectorShape::strided(2, 8));
        let r = transfer_add(s, lit(4));
        assert_eq!(r, VectorShape::strided(2, 4));
    }

    #[test]
    fn test_cmp_transfer() {
        assert!(transfer_generic(&[term(VectorShape::uni()), term(VectorShape::uni())]).is_uniform());
        assert!(
            transfer_generic(&[term(VectorShape::uni()), term(VectorShape::cont(1, 0))])
                .is_varying()
        );
    }

    #[test]
    fn test_undef_propagates() {
        let u = term(VectorShape::undef());
        assert!(transfer_add(u, lit(1)).is_undef());
        assert!(transfer_mul(u, lit(2)).is_undef());
        assert!(transfer_generic(&[u]).is_undef());
    }

    #[test]
    fn test_trunc_collapses() {
        assert_eq!(transfer_trunc(term(VectorShape::uni())), VectorShape::uni());
        assert_eq!(
            transfer_trunc(term(VectorShape::cont(1, 4))),
            VectorShape::varying(4)
        );
    }

    #[test]
    fn test_gep_scales_index() {
        let base = term(VectorShape::uni());
        let index = term(VectorShape::cont(1, 0));
        assert_eq!(transfer_gep(base, index, 8), VectorShape::cont(8, 1));
    }

    #[test]
    fn test_select_uniform_cond_merges() {
        let c = term(VectorShape::uni());
        let a = term(VectorShape::cont(1, 4));
        let b = term(VectorShape::cont(1, 6));
        assert_eq!(transfer_select(c, a, b), VectorShape::cont(1, 2));

        let vc = term(VectorShape::varying(1));
        assert!(transfer_select(vc, a, b).is_varying());
    }
}
