//! Named parameter access for external optimizer glue.

use ndarray::{ArrayViewD, ArrayViewMutD};

/// Anything that owns learnable arrays.
///
/// Names are dotted paths such as `layers.0.attn.to_q.weight`.
pub trait Parameters {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>));

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>));

    fn parameter_count(&self) -> usize {
        let mut total = 0;
        self.visit("", &mut |_, p| total += p.len());
        total
    }
}

/// Join a parameter path segment onto a prefix.
pub(crate) fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}
