fn main() {
    if let Err(e) = cairn_installer::run() {
        log::error!("{:#}", e);
        std::process::exit(cairn_error::exit_code_of(&e));
    }
}
