//! Factory listing command.

#![allow(clippy::print_literal)] // Table headers use literal strings intentionally

use nido_registry::ClientRegistry;

pub fn run() -> anyhow::Result<()> {
    let registry = ClientRegistry::with_builtins();
    println!("Available Factories");
    println!("===================");
    println!();
    println!("  {:10}  {:10}  {}", "Id", "Name", "Description");
    println!("  {:10}  {:10}  {}", "--", "----", "-----------");
    for factory in registry.all_factories() {
        println!(
            "  {:10}  {:10}  {}",
            factory.id, factory.name, factory.description
        );
    }
    Ok(())
}
