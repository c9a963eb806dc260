use std::env;

fn main() -> anyhow::Result<()> {
    // Necessary for ESP-IDF; host builds have no ESP-IDF environment to forward
    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();

        // Add crash log helper for better panic diagnostics
        println!("cargo:rustc-link-arg=-Wl,--undefined=esp_backtrace_print_app_description");
    }

    // Build number is appended to the version string ("v0.1" + BUILD_NUMBER)
    let build_number = env::var("BUILD_NUMBER").unwrap_or_else(|_| "-dev".to_string());
    println!("cargo:rustc-env=BUILD_NUMBER={}", build_number);
    println!("cargo:rerun-if-env-changed=BUILD_NUMBER");

    Ok(())
}
