//! Standard script classification utilities.

pub const OP_0: u8 = 0x00;
pub const OP_DUP: u8 = 0x76;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_16: u8 = 0x60;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptType {
    P2Pk,
    P2Pkh,
    P2Sh,
    P2Wpkh,
    P2Wsh,
    Unknown,
}

pub fn classify_script_pubkey(script: &[u8]) -> ScriptType {
    if is_p2pkh(script) {
        ScriptType::P2Pkh
    } else if is_p2sh(script) {
        ScriptType::P2Sh
    } else if is_p2wpkh(script) {
        ScriptType::P2Wpkh
    } else if is_p2wsh(script) {
        ScriptType::P2Wsh
    } else if is_p2pk(script) {
        ScriptType::P2Pk
    } else {
        ScriptType::Unknown
    }
}

pub fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

pub fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

pub fn is_p2wpkh(script: &[u8]) -> bool {
    script.len() == 22 && script[0] == OP_0 && script[1] == 0x14
}

pub fn is_p2wsh(script: &[u8]) -> bool {
    script.len() == 34 && script[0] == OP_0 && script[1] == 0x20
}

pub fn is_p2pk(script: &[u8]) -> bool {
    let key_len = match script.first().copied() {
        Some(len @ 33) => len,
        Some(len @ 65) => len,
        _ => return false,
    };

    let expected_len = key_len as usize + 2;
    script.len() == expected_len && script[script.len() - 1] == OP_CHECKSIG
}

/// Legacy sigop count: CHECKSIG ops count one, bare CHECKMULTISIG twenty.
pub fn sigop_count(script: &[u8]) -> usize {
    let mut count = 0usize;
    let mut cursor = 0usize;
    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        match opcode {
            0x01..=0x4b => cursor += opcode as usize,
            OP_PUSHDATA1 => {
                let Some(len) = script.get(cursor).copied() else {
                    break;
                };
                cursor += 1 + len as usize;
            }
            OP_PUSHDATA2 => {
                let Some(bytes) = script.get(cursor..cursor + 2) else {
                    break;
                };
                let len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
                cursor += 2 + len;
            }
            OP_PUSHDATA4 => {
                let Some(bytes) = script.get(cursor..cursor + 4) else {
                    break;
                };
                let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
                cursor += 4 + len;
            }
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => count += 20,
            _ => {}
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_templates() {
        let mut p2pkh = vec![OP_DUP, OP_HASH160, 0x14];
        p2pkh.extend_from_slice(&[0u8; 20]);
        p2pkh.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
        assert_eq!(classify_script_pubkey(&p2pkh), ScriptType::P2Pkh);

        let mut p2sh = vec![OP_HASH160, 0x14];
        p2sh.extend_from_slice(&[0u8; 20]);
        p2sh.push(OP_EQUAL);
        assert_eq!(classify_script_pubkey(&p2sh), ScriptType::P2Sh);

        let mut p2wpkh = vec![OP_0, 0x14];
        p2wpkh.extend_from_slice(&[0u8; 20]);
        assert_eq!(classify_script_pubkey(&p2wpkh), ScriptType::P2Wpkh);

        assert_eq!(classify_script_pubkey(&[0x6a]), ScriptType::Unknown);
    }

    #[test]
    fn sigop_counting() {
        assert_eq!(sigop_count(&[OP_CHECKSIG]), 1);
        assert_eq!(sigop_count(&[OP_CHECKMULTISIG]), 20);
        // Pushed data containing the CHECKSIG byte is not an op.
        assert_eq!(sigop_count(&[0x01, OP_CHECKSIG]), 0);
        assert_eq!(sigop_count(&[OP_PUSHDATA1, 0x01, OP_CHECKSIG]), 0);
    }
}
