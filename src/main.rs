//! `ptpd` daemon entry point.

fn main() {
    if let Err(err) = ptpd::run() {
        eprintln!("ptpd: {err:#}");
        std::process::exit(1);
    }
}
