use anyhow::Result;
use colored::Colorize;
use std::io::{self, IsTerminal, Write};

/// Prompts are only shown when a person is on the other end of stdin.
pub fn interactive() -> bool {
    io::stdin().is_terminal()
}

fn read_answer() -> Result<String> {
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

/// Confirm prompt with default Yes. Non-interactive returns true.
pub fn confirm_yes(msg: &str, interactive: bool) -> Result<bool> {
    if !interactive {
        return Ok(true);
    }
    o_print!("  {} [Y/n]: ", msg);
    let input = read_answer()?.to_lowercase();
    Ok(input.is_empty() || input == "y" || input == "yes")
}

/// Confirm prompt with default No. Non-interactive returns false.
pub fn confirm_no(msg: &str, interactive: bool) -> Result<bool> {
    if !interactive {
        return Ok(false);
    }
    o_print!("  {} [y/N]: ", msg);
    let input = read_answer()?.to_lowercase();
    Ok(input == "y" || input == "yes")
}

/// Text input with a default value. Non-interactive returns the default.
pub fn input_with_default(prompt: &str, default: &str, interactive: bool) -> Result<String> {
    if !interactive {
        return Ok(default.to_string());
    }
    o_print!("  {} [{}]: ", prompt, default.dimmed());
    let input = read_answer()?;
    if input.is_empty() {
        Ok(default.to_string())
    } else {
        Ok(input)
    }
}

/// Optional text input. Non-interactive and empty answers give `None`.
pub fn input_optional(prompt: &str, interactive: bool) -> Result<Option<String>> {
    if !interactive {
        return Ok(None);
    }
    o_print!("  {} ", prompt);
    let input = read_answer()?;
    Ok((!input.is_empty()).then_some(input))
}

/// Menu selection. Non-interactive returns default_index.
pub fn select(prompt: &str, options: &[String], default_index: usize, interactive: bool) -> Result<usize> {
    if !interactive {
        return Ok(default_index);
    }
    for (i, opt) in options.iter().enumerate() {
        o_detail!("   {} {}", format!("{})", i + 1).cyan(), opt);
    }
    o_print!("\n   {} [{}]: ", prompt, default_index + 1);
    let choice = read_answer()?;
    if choice.is_empty() {
        return Ok(default_index);
    }
    match choice.parse::<usize>() {
        Ok(n) if n >= 1 && n <= options.len() => Ok(n - 1),
        _ => Ok(default_index),
    }
}
