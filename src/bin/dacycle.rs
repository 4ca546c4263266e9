use dacycle::commands;
use dacycle::experiment::FactoryTable;

fn output_header() -> &'static str {
    "dacycle\ndacycle drives cyclic coupled-model data-assimilation experiments through a dependency-ordered stage graph."
}

fn main() {
    println!("{}\n", output_header());
    let args: Vec<String> = std::env::args().skip(1).collect();
    match commands::run_cli(args, &FactoryTable::builtin()) {
        Ok(output) => println!("{output}"),
        Err(failure) => {
            eprintln!("{}", failure.message);
            std::process::exit(failure.exit_code);
        }
    }
}
