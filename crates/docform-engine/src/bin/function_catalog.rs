use docform_engine::functions::{Function, ValueType};
use serde::Serialize;

#[derive(Serialize)]
struct FunctionCatalog {
    functions: Vec<FunctionCatalogEntry>,
}

#[derive(Serialize)]
struct FunctionCatalogEntry {
    name: &'static str,
    min_args: usize,
    /// `None` for variadic functions.
    max_args: Option<usize>,
    arity: String,
    return_type: &'static str,
}

fn value_type_to_str(value_type: ValueType) -> &'static str {
    match value_type {
        ValueType::Any => "any",
        ValueType::Number => "number",
        ValueType::Text => "text",
        ValueType::Bool => "bool",
    }
}

fn main() -> Result<(), serde_json::Error> {
    let mut functions: Vec<FunctionCatalogEntry> = Function::ALL
        .into_iter()
        .map(|function| {
            let spec = function.spec();
            FunctionCatalogEntry {
                name: spec.name,
                min_args: spec.min_args,
                max_args: (spec.max_args != usize::MAX).then_some(spec.max_args),
                arity: spec.arity_description(),
                return_type: value_type_to_str(spec.return_type),
            }
        })
        .collect();
    functions.sort_by_key(|entry| entry.name);

    let json = serde_json::to_string_pretty(&FunctionCatalog { functions })?;
    println!("{json}");
    Ok(())
}
