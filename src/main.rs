fn main() {
    if let Err(e) = mimic::cli::main() {
        eprintln!("❌ {e}");
        std::process::exit(1);
    }
}
