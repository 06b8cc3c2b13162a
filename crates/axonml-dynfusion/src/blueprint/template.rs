//! Template Expansion
//!
//! `{{tag}}` substitution, the shared variable table and the fixed parts of a
//! generated kernel (signature and coordinate section).
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::blueprint::code::TensorArgType;
use crate::error::{Error, Result};
use crate::id::TensorId;
use crate::kernel::{ClippingStrategy, TileDescriptor};

/// Tag name to replacement text.
pub(crate) type TagLut = FxHashMap<&'static str, String>;

/// Replaces every `{{tag}}` of `template`. Unknown tags are an error.
pub(crate) fn replace_tags(template: &str, tags: &TagLut) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(Error::codegen(format!("unterminated tag in template near '{}'", &rest[start..])));
        };
        let tag = &after[..end];
        let value = tags
            .get(tag)
            .ok_or_else(|| Error::codegen(format!("pattern {tag} not found in tags")))?;
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

// =============================================================================
// Shared Variables
// =============================================================================

/// Scope of a shared variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SharedVarGroup {
    /// Kernel argument.
    Argument,
    /// Tile declared inside the kernel body.
    Automatic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SharedVar {
    pub(crate) group: SharedVarGroup,
    pub(crate) uniq_name: String,
    pub(crate) arg_type: TensorArgType,
}

/// Every variable of a kernel, in declaration order. Names are unique:
/// `<name>_<declaration index>`.
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedVarTable {
    vars: BTreeMap<TensorId, SharedVar>,
    order: Vec<TensorId>,
}

impl SharedVarTable {
    /// Declares the variable of `tensor`, or returns the existing one.
    pub(crate) fn add(
        &mut self,
        tensor: TensorId,
        group: SharedVarGroup,
        name: &str,
        arg_type: TensorArgType,
    ) -> &SharedVar {
        let index = self.order.len();
        let order = &mut self.order;
        self.vars.entry(tensor).or_insert_with(|| {
            order.push(tensor);
            SharedVar {
                group,
                uniq_name: format!("{name}_{index}"),
                arg_type,
            }
        })
    }

    pub(crate) fn get(&self, tensor: TensorId) -> Option<&SharedVar> {
        self.vars.get(&tensor)
    }

    /// Kernel arguments in declaration order.
    pub(crate) fn arguments(&self) -> impl Iterator<Item = (TensorId, &SharedVar)> + '_ {
        self.order
            .iter()
            .map(|t| (*t, &self.vars[t]))
            .filter(|(_, v)| v.group == SharedVarGroup::Argument)
    }
}

// =============================================================================
// Fixed Sections
// =============================================================================

/// `__kernel void name(args...)`.
pub(crate) fn kernel_signature(name: &str, vtable: &SharedVarTable) -> String {
    let args: Vec<String> = vtable
        .arguments()
        .map(|(_, var)| format!("\n    {}", var.arg_type.declaration(&var.uniq_name)))
        .collect();
    format!("\n__kernel void {name}({})", args.join(","))
}

/// Work-item coordinates and boundary conditions for `tile`.
pub(crate) fn global_section(tile: &TileDescriptor) -> String {
    let tile_x = if tile.is_empty() { 1 } else { tile.tile_dims.x };
    let tile_y = if tile.is_empty() { 1 } else { tile.tile_dims.y };
    let cond_last_x = format!("((g_x + 1) * {tile_x} >= {})", tile.boundaries.x);
    let cond_last_y = format!("((g_y + 1) * {tile_y} >= {})", tile.boundaries.y);
    let first_x = "(g_x == 0)".to_string();
    let first_y = "(g_y == 0)".to_string();

    let (cond_x, cond_y) = match tile.clipping {
        ClippingStrategy::TopLeft => (first_x, first_y),
        ClippingStrategy::TopRight => (cond_last_x, first_y),
        ClippingStrategy::BottomLeft => (first_x, cond_last_y),
        ClippingStrategy::BottomRight => (cond_last_x, cond_last_y),
    };

    let mut code = String::new();
    code.push_str("    uint g_x = get_global_id(0);\n");
    code.push_str("    uint g_y = get_global_id(1);\n");
    code.push_str("    uint g_z = get_global_id(2);\n\n");
    code.push_str(&format!("    const bool g_cond_x = {cond_x};\n"));
    code.push_str(&format!("    const bool g_cond_y = {cond_y};\n"));
    code.push_str("\n    REPEAT_VAR_INIT_TO_CONST(M0, uint, g_zout, 0);\n");
    code.push_str("    REPEAT_VAR_INIT_TO_CONST(16, uint, g_zero, 0);\n\n");
    code
}

// =============================================================================
// Tests
// =============================================================================
