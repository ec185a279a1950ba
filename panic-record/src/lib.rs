// BEGIN - Embark standard lints v6 for Rust 1.55+
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::flat_map_option,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::from_iter_instead_of_collect,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_digit_groups,
    clippy::large_stack_arrays,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wild_err_arm,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::missing_enforced_import_renames,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::needless_for_each,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::rc_mutex,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::single_match_else,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v6 for Rust 1.55+

//! Portable types describing a panic, ie. an uncaught native exception, once
//! it has been enriched with a symbolized call stack.
//!
//! A [`PanicRecord`] is produced by whatever observed the fault (see the
//! `panic-handler` crate) and is handed, fully built, to a sink. Sinks can
//! either serialize it as is, or render it to the fixed textual layout
//! provided by [`format`].

mod format;
mod frame;
mod logical;

pub use format::{RULE, format};
pub use frame::Frame;
pub use logical::capture_logical_stack;

use serde::Serialize;

/// The two stacks attached to every [`PanicRecord`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Stack {
    /// Symbolized native frames of the faulting thread, oldest caller first
    pub native: Vec<Frame>,
    /// The logical, ie. Rust level, call path that was executing when the
    /// record was constructed. This is the instrumentation code that
    /// observed the fault, not the code that faulted.
    pub logical: Vec<String>,
}

/// A structured, symbolized report of a single panic.
///
/// Records are immutable once built, all fields are only reachable via
/// accessors.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PanicRecord {
    message: String,
    details: serde_json::Value,
    stack: Stack,
}

impl PanicRecord {
    /// Creates a record from an already resolved native stack, capturing the
    /// current logical stack.
    #[inline]
    pub fn new(message: impl Into<String>, details: serde_json::Value, native: Vec<Frame>) -> Self {
        Self::with_stack(
            message,
            details,
            Stack {
                native,
                logical: capture_logical_stack(),
            },
        )
    }

    /// Creates a record from both stacks, used when the logical stack was
    /// captured elsewhere, or must be deterministic.
    #[inline]
    pub fn with_stack(message: impl Into<String>, details: serde_json::Value, stack: Stack) -> Self {
        Self {
            message: message.into(),
            details,
            stack,
        }
    }

    /// The human readable summary of the panic
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The contextual payload attached by whatever raised the exception
    #[inline]
    pub fn details(&self) -> &serde_json::Value {
        &self.details
    }

    /// The native and logical stacks captured for the panic
    #[inline]
    pub fn stack(&self) -> &Stack {
        &self.stack
    }
}

impl std::fmt::Display for PanicRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format(self))
    }
}
