//! Inline page templates for the configuration web UI. Placeholders are
//! substituted with `str::replace`; both runtimes serve the same markup.

const SUCCESS_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <title>Pico W Wi-Fi Connected</title>
  <style>
    *{margin:0;padding:0;box-sizing:border-box;font-family:'Segoe UI',Tahoma,sans-serif}
    body{min-height:100vh;display:flex;justify-content:center;align-items:center;background:linear-gradient(135deg,#2ecc71,#27ae60);padding:20px}
    .container{background:#fff;padding:2rem;border-radius:15px;box-shadow:0 10px 20px rgba(0,0,0,.2);max-width:400px;width:100%;text-align:center}
    h1{color:#333;margin-bottom:1.5rem}
    .ip-address{background:#f8f9fa;padding:1rem;border-radius:5px;margin:1rem 0;color:#2c3e50;word-break:break-all}
    .link{margin-top:1rem;display:block;color:#2c3e50;text-decoration:none;padding:.5rem;border-radius:5px}
    .link:hover{background:#f0f0f0}
  </style>
</head>
<body>
  <div class="container">
    <h1>Wi-Fi Connected!</h1>
    <div class="ip-address">IP Address: {{ ip_address }}</div>
    <a href="/status" class="link">Check System Status</a>
    <a href="/config" class="link">Change Wi-Fi Configuration</a>
    <a href="/control" class="link">Control Dash Board</a>
  </div>
</body>
</html>"#;

const CONFIG_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <title>Pico W Wi-Fi Setup</title>
  <style>
    *{margin:0;padding:0;box-sizing:border-box;font-family:'Segoe UI',Tahoma,sans-serif}
    body{min-height:100vh;display:flex;justify-content:center;align-items:center;background:linear-gradient(135deg,#667eea,#764ba2);padding:20px}
    .container{background:#fff;padding:2rem;border-radius:15px;box-shadow:0 10px 20px rgba(0,0,0,.2);max-width:400px;width:100%}
    h1{color:#333;text-align:center;margin-bottom:1.5rem}
    .form-group{margin-bottom:1rem}
    label{display:block;margin-bottom:.5rem;color:#555}
    input{width:100%;padding:.8rem;border:1px solid #ddd;border-radius:5px;font-size:1rem}
    button{width:100%;padding:.8rem;background:#667eea;border:none;border-radius:5px;color:#fff;font-size:1rem;cursor:pointer}
    button:hover{background:#764ba2}
    .status{text-align:center;margin-top:1rem;color:#666;font-size:.9rem}
  </style>
</head>
<body>
  <div class="container">
    <h1>Wi-Fi Setup</h1>
    <form method="POST" action="/config">
      <div class="form-group">
        <label for="ssid">Wi-Fi Name (SSID)</label>
        <input type="text" list="ssid-list" id="ssid" name="ssid" required>
        <datalist id="ssid-list">{{ ssid_options }}</datalist>
      </div>
      <div class="form-group">
        <label for="password">Password</label>
        <input type="password" id="password" name="password" required>
      </div>
      <button type="submit">Save and Connect</button>
    </form>
    <div class="status">{{ status_message }}</div>
  </div>
</body>
</html>"#;

const STATUS_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <title>Pico W Status</title>
  <style>
    *{margin:0;padding:0;box-sizing:border-box;font-family:'Segoe UI',Tahoma,sans-serif}
    body{min-height:100vh;display:flex;justify-content:center;align-items:center;background:linear-gradient(135deg,#3498db,#2980b9);padding:20px}
    .container{background:#fff;padding:2rem;border-radius:15px;box-shadow:0 10px 20px rgba(0,0,0,.2);max-width:400px;width:100%;text-align:center}
    h1{color:#333;margin-bottom:1.5rem}
    .info{background:#f8f9fa;padding:1rem;border-radius:5px;margin:1rem 0;color:#2c3e50;word-break:break-all}
    .link{margin-top:1rem;display:block;color:#2c3e50;text-decoration:none;padding:.5rem;border-radius:5px;cursor:pointer}
    .link:hover{background:#f0f0f0}
    button{width:100%;padding:.8rem;background:#667eea;border:none;border-radius:5px;color:#fff;font-size:1rem;cursor:pointer}
    fieldset{border-radius:10px}
    legend{padding:0 10px}
  </style>
</head>
<body>
  <div class="container">
    <h1>Device Status</h1>
    <div class="info">IP Address: {{ ip_address }}</div>
    <div class="info">Wi-Fi SSID: {{ ssid }}</div>
    <div class="info">Connection Status: {{ status }}</div>
    <div class="info">
      <button id="check-update">Check Update</button>
      <div id="update-info">Version: {{ version }}</div>
    </div>
    <a href="/" class="link">Back to Home</a>
    <a href="/config" class="link">Change Wi-Fi Configuration</a>
    <a href="/control" class="link">Control Dash Board</a>
    <fieldset>
      <legend>Advanced</legend>
      <div class="link" id="to_be_updated">Update on Next Reboot</div>
      <div class="link" id="no_auto_run">No Auto Run Next Reboot</div>
      <div class="link" id="reset">Reset Device</div>
    </fieldset>
  </div>
  <script>
    const act=(action)=>fetch('/system?action='+action)
      .then(r=>r.text())
      .then(t=>{document.getElementById('update-info').textContent=t;})
      .catch(()=>{document.getElementById('update-info').textContent='Request failed';});
    document.getElementById('check-update').addEventListener('click',()=>act('check_update'));
    document.getElementById('to_be_updated').addEventListener('click',()=>act('to_be_updated'));
    document.getElementById('no_auto_run').addEventListener('click',()=>act('no_auto_run'));
    document.getElementById('reset').addEventListener('click',()=>act('reset'));
  </script>
</body>
</html>"#;

const CONTROL_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <title>Pico W Control</title>
  <style>
    *{margin:0;padding:0;box-sizing:border-box;font-family:'Segoe UI',Tahoma,sans-serif}
    body{min-height:100vh;display:flex;justify-content:center;align-items:center;background:linear-gradient(135deg,#f39c12,#e67e22);padding:20px}
    .container{background:#fff;padding:2rem;border-radius:15px;box-shadow:0 10px 20px rgba(0,0,0,.2);max-width:400px;width:100%;text-align:center}
    h1{color:#333;margin-bottom:1.5rem}
    button{width:100%;padding:.8rem;background:#667eea;border:none;border-radius:5px;color:#fff;font-size:1rem;cursor:pointer}
    #swatch{height:3rem;border-radius:5px;margin:1rem 0;background:rgb(0,0,0)}
    .status{margin-top:1rem;color:#666;font-size:.9rem}
    .link{margin-top:1rem;display:block;color:#2c3e50;text-decoration:none;padding:.5rem;border-radius:5px}
  </style>
</head>
<body>
  <div class="container">
    <h1>RGB Control</h1>
    <div id="swatch"></div>
    <button id="toggle">Toggle RGB Task</button>
    <div class="status" id="rgb-status">{{ activate_status }}</div>
    <a href="/" class="link">Back to Home</a>
  </div>
  <script>
    document.getElementById('toggle').addEventListener('click',()=>{
      fetch('/control',{method:'POST'}).then(r=>r.text())
        .then(t=>{document.getElementById('rgb-status').textContent=t;});
    });
    setInterval(()=>{
      fetch('/control?attribute=current_rgb').then(r=>r.text())
        .then(c=>{document.getElementById('swatch').style.background=c;});
    },1000);
  </script>
</body>
</html>"#;

pub fn success_page(ip_address: &str) -> String {
    SUCCESS_HTML.replace("{{ ip_address }}", ip_address)
}

pub fn config_page(status_message: &str, ssids: &[String]) -> String {
    let mut options = String::new();
    for ssid in ssids {
        options.push_str(&format!("<option value=\"{ssid}\"></option>"));
    }
    CONFIG_HTML
        .replace("{{ ssid_options }}", &options)
        .replace("{{ status_message }}", status_message)
}

pub fn status_page(ip_address: &str, ssid: &str, status: &str, version: &str) -> String {
    STATUS_HTML
        .replace("{{ ip_address }}", ip_address)
        .replace("{{ ssid }}", ssid)
        .replace("{{ status }}", status)
        .replace("{{ version }}", version)
}

pub fn control_page(activate_status: &str) -> String {
    CONTROL_HTML.replace("{{ activate_status }}", activate_status)
}
