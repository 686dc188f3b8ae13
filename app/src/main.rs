fn main() {
    if let Err(err) = platform::run() {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}
