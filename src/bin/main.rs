fn main() {
    peernet_cli::main();
}
