use colored::*;
use serde_json::json;
use vhsm_pay::{PaymentHsm, TamperReason, VulnerabilityConfig};

fn print_trace(response: &vhsm_pay::CommandResponse) {
    for (index, step) in response.trace.iter().enumerate() {
        println!(
            "    {} {} {}",
            format!("{}.", index + 1).blue(),
            step.name.bright_white(),
            format!("- {}", step.detail).bright_black()
        );
        println!("       in:  {}", step.input.bright_black());
        println!("       out: {}", step.output.bright_cyan());
    }
}

fn main() {
    println!("{}", "═══════════════════════════════════════════════════════════════".cyan().bold());
    println!("{}", "     Payment HSM Firmware Demo                                 ".cyan().bold());
    println!("{}", "═══════════════════════════════════════════════════════════════".cyan().bold());
    println!();

    println!("{} Booting device...", "→".green());
    let hsm = PaymentHsm::new("HSM-DEMO-01");
    println!("{} Device {} is {}", "✓".green(), hsm.device_id().bright_cyan(), "OPERATIONAL".green().bold());
    println!();

    println!("{} Provisioning default key set...", "→".green());
    let keys = hsm.provision_test_keys().expect("provisioning");
    for key in &keys {
        println!(
            "  - {} {} {} KCV {}",
            key.label.bright_cyan(),
            key.key_type,
            key.algorithm,
            key.check_value.yellow()
        );
    }
    println!();

    println!("{}", "═══════════════════════════════════════════════════════════════".yellow().bold());
    println!("{}", "                  Command Walk-Through                         ".yellow().bold());
    println!("{}", "═══════════════════════════════════════════════════════════════".yellow().bold());
    println!();

    println!("{} B4: encrypt PIN 1234 for PAN 4111111111111111...", "→".green());
    let response = hsm
        .execute(
            "B4",
            json!({ "pin": "1234", "pan": "4111111111111111", "keyLabel": "ZPK-TEST" }),
        )
        .expect("B4");
    println!("  pinBlock: {}", response.result["pinBlock"].as_str().unwrap().bright_white());
    print_trace(&response);
    println!();

    println!("{} C0: Retail MAC over 'Transaction data'...", "→".green());
    let response = hsm
        .execute(
            "C0",
            json!({ "data": "Transaction data", "keyLabel": "ZAK-TEST", "algorithm": "ALG3" }),
        )
        .expect("C0");
    let mac = response.result["mac"].as_str().unwrap().to_string();
    println!("  mac: {}", mac.bright_white());
    print_trace(&response);
    println!();

    println!("{} C2: verify the MAC we just produced...", "→".green());
    let response = hsm
        .execute(
            "C2",
            json!({ "data": "Transaction data", "mac": mac, "keyLabel": "ZAK-TEST", "algorithm": "ALG3" }),
        )
        .expect("C2");
    println!("  verified: {}", response.result["verified"].to_string().green().bold());
    println!();

    println!("{} D4: CVV for 4111111111111111 exp 2812 service 101...", "→".green());
    let response = hsm
        .execute(
            "D4",
            json!({ "pan": "4111111111111111", "expiry": "2812", "serviceCode": "101", "keyLabel": "CVK-TEST" }),
        )
        .expect("D4");
    println!("  cvv: {}", response.result["cvv"].as_str().unwrap().bright_white().bold());
    print_trace(&response);
    println!();

    println!("{}", "═══════════════════════════════════════════════════════════════".yellow().bold());
    println!("{}", "                  Vulnerability Injection                      ".yellow().bold());
    println!("{}", "═══════════════════════════════════════════════════════════════".yellow().bold());
    println!();

    println!("{} Importing weak ZPK 1111...1111 in secure mode...", "→".green());
    match hsm.import_key(
        "ZPK-WEAK",
        vhsm_pay::KeyType::Zpk,
        vhsm_pay::KeyAlgorithm::TripleDes2,
        "11111111111111111111111111111111",
    ) {
        Ok(_) => println!("{} unexpectedly accepted", "✗".red()),
        Err(error) => println!("{} rejected: {}", "✓".green(), error.to_string().red()),
    }

    println!("{} Enabling weakKeysEnabled and retrying...", "→".green());
    hsm.set_vuln_config(VulnerabilityConfig {
        weak_keys_enabled: true,
        ..VulnerabilityConfig::default()
    });
    let weak = hsm
        .import_key(
            "ZPK-WEAK",
            vhsm_pay::KeyType::Zpk,
            vhsm_pay::KeyAlgorithm::TripleDes2,
            "11111111111111111111111111111111",
        )
        .expect("weak import under policy");
    println!("{} accepted with KCV {}", "✓".green(), weak.check_value.yellow());
    println!();

    println!("{}", "═══════════════════════════════════════════════════════════════".red().bold());
    println!("{}", "                  Tamper Event                                 ".red().bold());
    println!("{}", "═══════════════════════════════════════════════════════════════".red().bold());
    println!();

    println!("{} Asserting the tamper line...", "→".green());
    hsm.trigger_tamper(TamperReason::ManualTrigger);
    let status = hsm.status();
    println!(
        "{} Device is {} with {} keys loaded",
        "✓".green(),
        status.state.to_string().red().bold(),
        status.keys_loaded
    );

    println!("{} Re-running B4 against the tampered device...", "→".green());
    match hsm.execute(
        "B4",
        json!({ "pin": "1234", "pan": "4111111111111111", "keyLabel": "ZPK-TEST" }),
    ) {
        Ok(_) => println!("{} unexpectedly succeeded", "✗".red()),
        Err(error) => println!("{} {}", "✓".green(), error.to_string().red()),
    }
    println!();

    println!(
        "{} Audit trail: {} entries, chain {}",
        "→".green(),
        hsm.audit().len(),
        if hsm.audit().verify_chain() {
            "intact".green().bold()
        } else {
            "BROKEN".red().bold()
        }
    );
}
