use std::fmt::Write;

use super::ir::{Access, CExpr, FieldShape, Function, Repeat, Role, Stmt, Vertex, VertexKind};
use crate::{ops::UnaryOp, typing::format_literal};

/// Render `vertex` as kernel source, using `name` as the class name.
pub fn render(vertex: &Vertex, name: &str) -> String {
    let mut out = String::new();
    out.push_str("#include <poplar/Vertex.hpp>\n");
    out.push_str("#include \"tilesolve/kernel.hpp\"\n\n");
    let _ = writeln!(out, "class {name} : public ::poplar::{} {{", vertex.kind.base_class());
    out.push_str(" public:\n");
    let _ = writeln!(out, "  using ConcreteVertexType = {name};");
    for field in &vertex.fields {
        let ty = field.ty.c_name();
        let decl = match (field.shape, field.access) {
            (FieldShape::Param, _) => ty.to_owned(),
            (FieldShape::Vector, Access::Input) => format!("::poplar::Input<::poplar::Vector<{ty}>>"),
            (FieldShape::Vector, Access::Output) => format!("::poplar::Output<::poplar::Vector<{ty}>>"),
            (FieldShape::Vector, Access::InOut) => format!("::poplar::InOut<::poplar::Vector<{ty}>>"),
        };
        let _ = writeln!(out, "  {decl} {};", field.name);
    }
    for f in &vertex.functions {
        out.push('\n');
        render_function(&mut out, vertex, f);
    }
    if vertex.kind == VertexKind::SupervisorVertex {
        out.push('\n');
        render_supervisor(&mut out, vertex);
    }
    out.push_str("};\n");
    out
}

fn role_attribute(role: Role) -> &'static str {
    match role {
        Role::Worker => "__attribute__((target(\"worker\")))",
        Role::Supervisor => "__attribute__((target(\"supervisor\")))",
    }
}

fn render_function(out: &mut String, vertex: &Vertex, f: &Function) {
    let args: Vec<String> = f.args.iter().map(|a| format!("{} var{}", a.ty.c_name(), a.id)).collect();
    let _ = writeln!(out, "  {} {} {}({}) {{", role_attribute(f.role), f.ret.c_name(), f.name, args.join(", "));
    render_block(out, vertex, &f.body, 2);
    out.push_str("  }\n");
}

// the phase list becomes the supervisor's compute
fn render_supervisor(out: &mut String, vertex: &Vertex) {
    let _ = writeln!(out, "  {} bool compute() {{", role_attribute(Role::Supervisor));
    for phase in &vertex.phases {
        let name = vertex.function(phase.worker).map(|f| f.name.as_str()).unwrap_or("missing");
        let start = format!("startOnAllWorkers<&ConcreteVertexType::{name}>(this, phase);");
        match &phase.repeat {
            Repeat::Once => {
                let _ = writeln!(out, "    {{\n      unsigned int phase = 0u;\n      {start}\n      syncAllWorkers();\n    }}");
            }
            Repeat::Ascending(count) => {
                let count = expr(vertex, count);
                let _ = writeln!(out, "    for (unsigned int phase = 0u; phase < {count}; ++phase) {{");
                let _ = writeln!(out, "      {start}\n      syncAllWorkers();\n    }}");
            }
            Repeat::Descending(count) => {
                let count = expr(vertex, count);
                let _ = writeln!(out, "    for (int phase = int({count}) - 1; phase >= 0; --phase) {{");
                let _ = writeln!(out, "      {start}\n      syncAllWorkers();\n    }}");
            }
        }
    }
    out.push_str("    return true;\n  }\n");
}

fn render_block(out: &mut String, vertex: &Vertex, stmts: &[Stmt], depth: usize) {
    for s in stmts {
        render_stmt(out, vertex, s, depth);
    }
}

fn render_stmt(out: &mut String, vertex: &Vertex, stmt: &Stmt, depth: usize) {
    let pad = "  ".repeat(depth);
    match stmt {
        Stmt::Declare { var, init: Some(init) } => {
            let _ = writeln!(out, "{pad}{} var{} = {};", var.ty.c_name(), var.id, expr(vertex, init));
        }
        Stmt::Declare { var, init: None } => {
            let _ = writeln!(out, "{pad}{} var{};", var.ty.c_name(), var.id);
        }
        Stmt::Assign { var, value } => {
            let _ = writeln!(out, "{pad}var{} = {};", var.id, expr(vertex, value));
        }
        Stmt::Store { field, index, value } => {
            let name = &vertex.field(*field).name;
            let _ = writeln!(out, "{pad}{name}[{}] = {};", expr(vertex, index), expr(vertex, value));
        }
        Stmt::If { cond, then, otherwise } => {
            let _ = writeln!(out, "{pad}if ({}) {{", expr(vertex, cond));
            render_block(out, vertex, then, depth + 1);
            if !otherwise.is_empty() {
                let _ = writeln!(out, "{pad}}} else {{");
                render_block(out, vertex, otherwise, depth + 1);
            }
            let _ = writeln!(out, "{pad}}}");
        }
        Stmt::While { cond, body } => {
            let _ = writeln!(out, "{pad}while ({}) {{", expr(vertex, cond));
            render_block(out, vertex, body, depth + 1);
            let _ = writeln!(out, "{pad}}}");
        }
        Stmt::For { var, start, end, step, body } => {
            let v = format!("var{}", var.id);
            let _ = writeln!(
                out,
                "{pad}for ({} {v} = {}; {v} < {}; {v} += {}) {{",
                var.ty.c_name(),
                expr(vertex, start),
                expr(vertex, end),
                expr(vertex, step)
            );
            render_block(out, vertex, body, depth + 1);
            let _ = writeln!(out, "{pad}}}");
        }
        Stmt::Break => { let _ = writeln!(out, "{pad}break;"); }
        Stmt::Continue => { let _ = writeln!(out, "{pad}continue;"); }
        Stmt::Return(Some(value)) => { let _ = writeln!(out, "{pad}return {};", expr(vertex, value)); }
        Stmt::Return(None) => { let _ = writeln!(out, "{pad}return;"); }
    }
}

pub fn expr(vertex: &Vertex, e: &CExpr) -> String {
    match e {
        CExpr::Lit { value, ty } => format_literal(*value, *ty),
        CExpr::Var(v) => format!("var{}", v.id),
        CExpr::Load { field, index } => format!("{}[{}]", vertex.field(*field).name, expr(vertex, index)),
        CExpr::Size(field) => format!("{}.size()", vertex.field(*field).name),
        CExpr::Param(field) => vertex.field(*field).name.clone(),
        CExpr::Unary { op: UnaryOp::Negate, arg, .. } => format!("(-{})", expr(vertex, arg)),
        CExpr::Unary { op: UnaryOp::LogicalNot, arg, .. } => format!("(!{})", expr(vertex, arg)),
        CExpr::Unary { op: UnaryOp::BitwiseNot, arg, .. } => format!("(~{})", expr(vertex, arg)),
        CExpr::Unary { op, ty, arg } => format!("::tilesolve::{}<{}>({})", op.name(), ty.c_name(), expr(vertex, arg)),
        CExpr::Binary { op, ty, lhs, rhs } => match op.symbol() {
            Some(sym) => format!("({} {sym} {})", expr(vertex, lhs), expr(vertex, rhs)),
            None => format!("::tilesolve::{}<{}>({}, {})", op.name(), ty.c_name(), expr(vertex, lhs), expr(vertex, rhs)),
        },
        CExpr::Cast { ty, arg } => format!("static_cast<{}>({})", ty.c_name(), expr(vertex, arg)),
        CExpr::Call { func, args, .. } => {
            let name = vertex.function(*func).map(|f| f.name.as_str()).unwrap_or("missing");
            let args: Vec<String> = args.iter().map(|a| expr(vertex, a)).collect();
            format!("{name}({})", args.join(", "))
        }
    }
}
