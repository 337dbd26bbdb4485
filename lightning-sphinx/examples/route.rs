use lightning_sphinx::failure::{FailureMessage, FailurePacket};
use lightning_sphinx::{HopPayload, Sphinx};

use rand::RngCore;
use secp256k1::{PublicKey, Secp256k1, SecretKey};

fn random_key(secp: &Secp256k1<secp256k1::All>) -> (SecretKey, PublicKey) {
    let mut rng = rand::thread_rng();
    let mut bytes = [0u8; 32];
    rng.fill_bytes(&mut bytes);
    let private_key = SecretKey::from_slice(&bytes).expect("RNG is busted");
    (private_key, private_key.public_key(secp))
}

fn main() {
    let secp = Secp256k1::new();
    let sphinx = Sphinx::payment();

    let nodes: Vec<(SecretKey, PublicKey)> = (0..5).map(|_| random_key(&secp)).collect();
    println!("I've generated {} route nodes", nodes.len());

    let hops: Vec<HopPayload> = nodes
        .iter()
        .enumerate()
        .map(|(i, (_, pubkey))| {
            let mut payload = vec![0x08];
            payload.extend_from_slice(&[i as u8 + 1; 8]);
            HopPayload {
                pubkey: *pubkey,
                payload,
            }
        })
        .collect();

    let (session_key, _) = random_key(&secp);
    let associated_data = [0x42; 32];
    let (onion, shared_secrets) = sphinx
        .create(&session_key, &hops, &associated_data)
        .unwrap();
    println!(
        "\x1B[33mOnion size: {} bytes (constant for any route length)\x1B[0m",
        onion.serialize().len()
    );

    let mut packet = onion;
    let mut last_secret = None;
    for (i, (private_key, _)) in nodes.iter().enumerate() {
        let peeled = sphinx
            .peel(private_key, &associated_data, &packet)
            .unwrap();
        println!(
            "Node {} unwrapped its layer: payload {}{}",
            i,
            hex::encode(&peeled.payload),
            if peeled.is_last { " (final hop)" } else { "" },
        );
        last_secret = Some(peeled.shared_secret);
        packet = peeled.next_packet;
    }

    // The final hop rejects the payment; the failure travels back through
    // every intermediate hop before the originator reads it.
    println!("Final node reports a failure:");
    let mut failure =
        FailurePacket::create(&last_secret.unwrap(), &FailureMessage::TemporaryNodeFailure)
            .unwrap();
    for i in (0..4).rev() {
        // Each upstream hop re-derives its shared secret from its own peel;
        // here we reuse the originator's copy for brevity.
        failure = failure.wrap(&shared_secrets[i].0);
        println!("Node {} wrapped the failure packet", i);
    }

    let (origin, message) = failure.decrypt(&shared_secrets).unwrap();
    println!(
        "\x1B[32mOriginator attributed {:?} to node {}\x1B[0m",
        message,
        nodes.iter().position(|(_, p)| *p == origin).unwrap(),
    );
}
