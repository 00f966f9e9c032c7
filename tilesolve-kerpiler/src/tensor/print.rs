use std::fmt::Write;

use super::Tensor;
use crate::{config::PrintFormat, error::Result, runtime::Runtime, typing::Type};

impl Tensor {
    /// Render the contents as nested brackets, one innermost row per line.
    /// Dimensions longer than the summarise threshold only show their edges.
    pub fn format(&self, rt: &Runtime, name: &str, fmt: &PrintFormat) -> Result<String> {
        let values = self.to_f64_vec(rt)?;
        let mut out = format!("{name}<{}, {}> = ", self.shape(), self.ty());
        Block { values: &values, ty: self.ty(), fmt }.write(&mut out, self.shape().global_shape().dims(), 0, 0);
        out.push('\n');
        Ok(out)
    }

    pub fn print(&self, rt: &Runtime, name: &str) -> Result<()> {
        print!("{}", self.format(rt, name, &PrintFormat::default())?);
        Ok(())
    }
}

struct Block<'a> {
    values: &'a [f64],
    ty: Type,
    fmt: &'a PrintFormat,
}

impl Block<'_> {
    // positions to show along a dimension of extent `n`, `None` is the ellipsis
    fn shown(&self, n: usize) -> Vec<Option<usize>> {
        let edge = self.fmt.edge_items;
        if n <= self.fmt.summarise_threshold || 2 * edge >= n {
            return (0..n).map(Some).collect();
        }
        (0..edge).map(Some).chain([None]).chain((n - edge..n).map(Some)).collect()
    }

    fn write(&self, out: &mut String, dims: &[usize], offset: usize, depth: usize) {
        let Some((&n, rest)) = dims.split_first() else { return };
        let stride: usize = rest.iter().product();
        if rest.is_empty() {
            let items: Vec<String> = self
                .shown(n)
                .into_iter()
                .map(|i| match i {
                    Some(i) => value(self.values[offset + i], self.ty),
                    None => "...".to_owned(),
                })
                .collect();
            let _ = write!(out, "[{}]", items.join(", "));
            return;
        }
        let indent = "  ".repeat(depth + 1);
        out.push_str("[\n");
        for i in self.shown(n) {
            out.push_str(&indent);
            match i {
                Some(i) => self.write(out, rest, offset + i * stride, depth + 1),
                None => out.push_str("..."),
            }
            out.push('\n');
        }
        out.push_str(&"  ".repeat(depth));
        out.push(']');
    }
}

fn value(v: f64, ty: Type) -> String {
    if ty.is_bool() {
        return (v != 0.0).to_string();
    }
    if v.is_finite() && v.fract() == 0.0 {
        // integral values print without a fraction
        format!("{v:.0}")
    } else {
        v.to_string()
    }
}
