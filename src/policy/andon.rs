use bitcoin::Psbt;

use super::Policy;

/// Andon cord: when pulled, nothing gets signed until an operator resets it.
#[derive(Debug, Clone, Copy)]
pub struct AndonPolicy {
    halted: bool,
}

impl AndonPolicy {
    pub fn new(halted: bool) -> Self {
        Self { halted }
    }
}

impl Policy for AndonPolicy {
    fn name(&self) -> &'static str {
        "andon"
    }

    fn check(&self, _psbt: &Psbt) -> Result<(), String> {
        if self.halted {
            Err("all transactions have been halted".to_string())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::testing::*;

    #[test]
    fn halted_refuses_everything() {
        let psbt = psbt_paying(vec![(foreign_script(1), 1)]);
        assert!(AndonPolicy::new(false).check(&psbt).is_ok());
        assert!(AndonPolicy::new(true).check(&psbt).is_err());
    }
}
