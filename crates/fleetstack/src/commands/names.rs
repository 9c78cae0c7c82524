use colored::Colorize;
use fleetstack_core::derive_name;

pub fn handle(stack: &str, env: &str, parent_env: Option<&str>, resource: &str) {
    let name = derive_name(stack, env, parent_env, resource);
    if let Some(parent) = parent_env.filter(|p| *p != env) {
        eprintln!(
            "{}",
            format!("{} shares resources with {}", env, parent).dimmed()
        );
    }
    println!("{}", name);
}
