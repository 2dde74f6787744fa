mod gen;

fn main() {
    let task = std::env::args().nth(1);
    match task.as_deref() {
        Some("gen") => gen::gen(),
        _ => {
            eprintln!("Tasks:\n  gen    generate shell completions into ./completions");
            std::process::exit(1);
        }
    }
}
