//! Browser pages. Plain HTML + inline script against the JSON API and `/api/changes`.

pub const LANDING_HTML: &str = r###"<!doctype html>
<html lang="pt-BR">
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1" />
  <title>DUGA-2</title>
  <style>
    body{background:#020a02;color:#33ff33;font-family:ui-monospace,Menlo,monospace;padding:24px}
    a{color:#33ff33}
    #enter{display:none;margin-top:16px}
  </style>
</head>
<body>
  <pre id="boot"></pre>
  <button id="skip" type="button">[ PULAR ]</button>
  <div id="enter"><a href="/mapa">[ ENTRAR NO MAPA ]</a></div>
  <script>
  (function(){
    const lines = [
      "INICIANDO PROTOCOLO DUGA-2...", "---",
      "BUSCANDO HARDWARE COMPATÍVEL...", "ASSINATURA DE ASSIMILAÇÃO ENCONTRADA.",
      "BEM-VINDOS, ", "...", "SISTEMA PRONTO."
    ];
    const boot = document.getElementById("boot");
    const enter = document.getElementById("enter");
    let i = 0;
    const timer = setInterval(() => {
      if (i >= lines.length) { done(); return; }
      boot.textContent += lines[i++] + "\n";
    }, 450);
    function done(){
      clearInterval(timer);
      boot.textContent = lines.join("\n");
      enter.style.display = "block";
    }
    document.getElementById("skip").addEventListener("click", done);
  })();
  </script>
</body>
</html>
"###;

pub const MAP_HTML: &str = r###"<!doctype html>
<html lang="pt-BR">
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1" />
  <title>Mapa Tático</title>
  <style>
    body{margin:0;background:#050805;color:#cfe;font-family:ui-monospace,Menlo,monospace}
    #map{position:relative;width:100vw;height:100vh;overflow:hidden}
    .area{position:absolute;cursor:pointer}
    .area img{width:100%;display:block}
    .area.dimmed{opacity:.35}
    .ping{position:absolute;transform:translate(-50%,-50%);font-size:22px}
    #log{position:fixed;top:0;right:0;width:340px;height:100vh;overflow:auto;background:#000c;display:none;padding:12px}
    #log.open{display:block}
    .entry{padding:6px 8px;margin-bottom:6px}
    .hl{text-decoration:underline}
    #info{position:fixed;left:12px;bottom:12px;background:#000c;padding:12px;display:none;min-width:260px}
    header{position:fixed;top:8px;left:12px;z-index:50}
  </style>
</head>
<body>
  <header>
    <strong>MAPA TÁTICO: ZONA DE EXCLUSÃO</strong>
    <button id="toggleLog" type="button">[ ABRIR LOGS ]</button>
  </header>
  <main id="map"></main>
  <aside id="log"></aside>
  <aside id="info"></aside>
  <script>
  (function(){
    const $ = (id) => document.getElementById(id);
    let areas = [];
    let events = [];
    let seen = new Set();
    let selected = null;
    let historyOpen = false;

    function esc(s){
      return String(s ?? "").replace(/[&<>"]/g, (c) => ({ "&":"&amp;", "<":"&lt;", ">":"&gt;", "\"":"&quot;" }[c]));
    }
    function formatted(text){
      return String(text ?? "").split("||").map((part, i) => i % 2 === 1 ? `<span class="hl">${esc(part)}</span>` : esc(part)).join("");
    }
    function standingColor(v){ return v <= 30 ? "#ff3333" : v <= 60 ? "#ffff33" : "#33ff33"; }
    function setHistory(open){
      historyOpen = open;
      $("log").classList.toggle("open", open);
      $("toggleLog").textContent = open ? "[ FECHAR LOGS ]" : "[ ABRIR LOGS ]";
    }
    function chime(){ try { new Audio("/ping.mp3").play().catch(() => {}); } catch(_e) {} }

    async function loadSnapshot(){
      try {
        const r = await fetch("/api/areas?with=factions", { cache: "no-store" });
        if (r.ok) areas = await r.json();
      } catch(_e) {}
      try {
        const r = await fetch("/api/events", { cache: "no-store" });
        if (r.ok) {
          events = await r.json();
          seen = new Set(events.map((e) => e.id));
        }
      } catch(_e) {}
      render();
    }

    function applyChange(c){
      if (c.table !== "events") { loadSnapshot(); return; }
      if (c.kind === "INSERT" && c.new) {
        if (seen.has(c.new.id)) return;
        seen.add(c.new.id);
        events = [c.new, ...events];
        setHistory(true);
        chime();
      } else if (c.kind === "UPDATE" && c.new) {
        events = events.map((e) => e.id === c.new.id ? c.new : e);
      } else if (c.kind === "DELETE" && c.old) {
        seen.delete(c.old.id);
        events = events.filter((e) => e.id !== c.old.id);
      }
      render();
    }

    function render(){
      const map = $("map");
      map.innerHTML = "";
      for (const a of areas){
        const el = document.createElement("div");
        el.className = "area" + (selected && selected !== a.id ? " dimmed" : "");
        el.style.top = a.top_pos; el.style.left = a.left_pos;
        el.style.width = a.width_css; el.style.zIndex = a.z_index || 1;
        el.innerHTML = `<img src="${esc(a.image_url || "/images/placeholder.png")}" alt="${esc(a.name)}">`;
        el.addEventListener("click", () => { selected = selected === a.id ? null : a.id; render(); });
        map.appendChild(el);
      }
      for (const ev of events){
        if (!ev.active || !ev.top_pos || !ev.left_pos) continue;
        const p = document.createElement("div");
        p.className = "ping";
        p.style.top = ev.top_pos; p.style.left = ev.left_pos; p.style.color = ev.color;
        p.textContent = "◉";
        map.appendChild(p);
      }
      const log = $("log");
      log.innerHTML = events.length === 0 ? "<div>SEM REGISTROS</div>" : events.map((ev) => {
        const t = new Date(ev.created_at).toLocaleTimeString([], { hour: "2-digit", minute: "2-digit" });
        const at = ev.location_name ? `<div>@ ${esc(ev.location_name)}</div>` : "";
        return `<div class="entry" style="border-left:4px solid ${esc(ev.color)}"><b style="color:${esc(ev.color)}">[${formatted(ev.title)}]</b> ${t}<div>${esc(ev.message)}</div>${at}</div>`;
      }).join("");
      const info = $("info");
      const area = areas.find((a) => a.id === selected);
      if (!area) { info.style.display = "none"; return; }
      const rep = area.factions ? area.factions.reputation : 0;
      info.style.display = "block";
      info.innerHTML = `<h3>&gt; ${esc(area.name)}</h3>
        <div>${esc(area.factions ? area.factions.name : "TERRITÓRIO CONTESTADO")}</div>
        <div>PERIGO: ${esc(area.danger)}</div>
        <div style="color:${standingColor(rep)}">REPUTAÇÃO: ${rep}%</div>
        <p>${esc(area.description)}</p>`;
    }

    $("toggleLog").addEventListener("click", () => setHistory(!historyOpen));

    const feed = new EventSource("/api/changes");
    feed.addEventListener("change", (m) => { try { applyChange(JSON.parse(m.data)); } catch(_e) {} });
    feed.addEventListener("lagged", () => loadSnapshot());
    window.addEventListener("beforeunload", () => feed.close());
    loadSnapshot();
  })();
  </script>
</body>
</html>
"###;

pub const ADMIN_HTML: &str = r###"<!doctype html>
<html lang="pt-BR">
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1" />
  <title>Mestre</title>
  <style>
    body{background:#070707;color:#ddd;font-family:ui-monospace,Menlo,monospace;padding:16px}
    section{border:1px solid #333;padding:12px;margin-bottom:16px}
    .row{display:flex;gap:8px;align-items:center;margin:4px 0}
    #console{display:none}
  </style>
</head>
<body>
  <div id="gate">
    <input id="password" type="password" autocomplete="off" />
    <button id="enter" type="button">ENTRAR</button>
  </div>
  <div id="console">
    <button id="logout" type="button">SAIR</button>
    <section><h2>FACÇÕES</h2><div id="factions"></div></section>
    <section>
      <h2 id="formTitle">NOVO EVENTO / PING</h2>
      <form id="eventForm">
        <div class="row"><input id="evTitle" value="INFO" /><input id="evColor" type="color" value="#33ff33" /></div>
        <div class="row"><select id="evArea"><option value="">SEM LOCAL (SÓ LOG)</option></select></div>
        <textarea id="evMsg" rows="4" placeholder="Mensagem do log..."></textarea>
        <div class="row"><button id="evSubmit" type="submit">TRANSMITIR</button><button id="evCancel" type="button" style="display:none">CANCELAR</button></div>
      </form>
    </section>
    <section><h2>EVENTOS</h2><div id="events"></div></section>
    <section>
      <h2>ÁREAS</h2>
      <form id="areaForm">
        <div class="row"><select id="arSlug"><option value="">--</option></select></div>
        <div class="row"><input id="arName" /><input id="arDanger" /></div>
        <div class="row"><select id="arFaction"><option value="0">NENHUMA</option></select></div>
        <textarea id="arDesc" rows="3"></textarea>
        <div class="row"><button type="submit">SALVAR ÁREA</button></div>
      </form>
    </section>
  </div>
  <script>
  (function(){
    const $ = (id) => document.getElementById(id);
    let factions = [], areas = [], events = [];
    let editingId = null;
    let feed = null;

    function esc(s){
      return String(s ?? "").replace(/[&<>"]/g, (c) => ({ "&":"&amp;", "<":"&lt;", ">":"&gt;", "\"":"&quot;" }[c]));
    }
    async function api(method, path, body){
      return fetch(path, { method, headers: { "content-type": "application/json" }, body: body ? JSON.stringify(body) : undefined });
    }
    async function getJson(path){
      try { const r = await fetch(path, { cache: "no-store" }); return r.ok ? await r.json() : null; } catch(_e) { return null; }
    }

    async function reload(){
      factions = (await getJson("/api/factions")) || factions;
      areas = (await getJson("/api/areas")) || areas;
      events = (await getJson("/api/events")) || events;
      render();
    }

    function render(){
      $("factions").innerHTML = "";
      for (const f of factions){
        const row = document.createElement("div");
        row.className = "row";
        const color = f.reputation < 30 ? "#ff3333" : f.reputation > 60 ? "#33ff33" : "#ffff33";
        row.innerHTML = `<span>${esc(f.name)}</span><span style="color:${color}">${f.reputation}%</span><input type="range" min="0" max="100" value="${f.reputation}">`;
        row.querySelector("input").addEventListener("change", (e) => setReputation(f.id, parseInt(e.target.value, 10)));
        $("factions").appendChild(row);
      }
      const areaOptions = areas.map((a) => `<option value="${esc(a.slug)}">${esc(a.name)}</option>`).join("");
      const evArea = $("evArea").value, arSlug = $("arSlug").value;
      $("evArea").innerHTML = `<option value="">SEM LOCAL (SÓ LOG)</option>${areaOptions}`;
      $("arSlug").innerHTML = `<option value="">--</option>${areaOptions}`;
      $("evArea").value = evArea; $("arSlug").value = arSlug;
      $("arFaction").innerHTML = `<option value="0">NENHUMA</option>` + factions.map((f) => `<option value="${f.id}">${esc(f.name)}</option>`).join("");
      fillAreaForm();
      $("events").innerHTML = "";
      for (const ev of events){
        const row = document.createElement("div");
        row.className = "row";
        row.style.borderLeft = `5px solid ${ev.color}`;
        row.innerHTML = `<b>[${esc(ev.title)}]</b><span>${esc(ev.message)}</span><button type="button">EDITAR</button><button type="button">DELETAR</button>`;
        const [edit, del] = row.querySelectorAll("button");
        edit.addEventListener("click", () => startEdit(ev));
        del.addEventListener("click", () => deleteEvent(ev.id));
        $("events").appendChild(row);
      }
    }

    async function setReputation(id, value){
      factions = factions.map((f) => f.id === id ? { ...f, reputation: value } : f);
      render();
      try { await api("PATCH", `/api/factions/${id}`, { reputation: value }); } catch(_e) {}
    }

    function setMode(id){
      editingId = id;
      $("formTitle").textContent = id ? `EDITANDO #${id}` : "NOVO EVENTO / PING";
      $("evSubmit").textContent = id ? "SALVAR" : "TRANSMITIR";
      $("evCancel").style.display = id ? "inline" : "none";
    }
    function resetText(){ $("evMsg").value = ""; $("evTitle").value = "INFO"; }

    function startEdit(ev){
      setMode(ev.id);
      $("evTitle").value = ev.title;
      $("evColor").value = ev.color;
      $("evMsg").value = ev.message;
      const area = areas.find((a) => a.name === ev.location_name);
      $("evArea").value = area ? area.slug : "";
      window.scrollTo({ top: 0, behavior: "smooth" });
    }

    async function deleteEvent(id){
      if (!confirm("Tem certeza que quer deletar este log?")) return;
      try { await api("DELETE", `/api/events/${id}`); } catch(_e) {}
      await reload();
    }

    function fillAreaForm(){
      const area = areas.find((a) => a.slug === $("arSlug").value);
      if (!area) return;
      $("arName").value = area.name;
      $("arDesc").value = area.description;
      $("arFaction").value = String(area.faction_id || 0);
      $("arDanger").value = area.danger;
    }

    $("eventForm").addEventListener("submit", async (e) => {
      e.preventDefault();
      const message = $("evMsg").value;
      if (!message) return;
      const area = areas.find((a) => a.slug === $("evArea").value);
      const draft = { title: $("evTitle").value, color: $("evColor").value, message, active: true };
      if (area) {
        draft.location = {
          top_pos: area.ping_top || area.top_pos,
          left_pos: area.ping_left || area.left_pos,
          location_name: area.name,
        };
      }
      try {
        if (editingId) { await api("PATCH", `/api/events/${editingId}`, draft); setMode(null); }
        else { await api("POST", "/api/events", draft); }
      } catch(_e) {}
      await reload();
      resetText();
    });
    $("evCancel").addEventListener("click", () => { setMode(null); resetText(); });
    $("evTitle").addEventListener("input", (e) => { e.target.value = e.target.value.toUpperCase(); });

    $("arSlug").addEventListener("change", fillAreaForm);
    $("areaForm").addEventListener("submit", async (e) => {
      e.preventDefault();
      const slug = $("arSlug").value;
      if (!slug) return;
      const faction = parseInt($("arFaction").value, 10);
      const body = { name: $("arName").value, description: $("arDesc").value, danger: $("arDanger").value, faction_id: faction === 0 ? null : faction };
      let ok = false;
      try { ok = (await api("PATCH", `/api/areas/${encodeURIComponent(slug)}`, body)).ok; } catch(_e) {}
      if (ok) { alert(`Área ${body.name} atualizada!`); await reload(); }
      else alert("Erro ao atualizar área.");
    });

    $("password").addEventListener("input", (e) => { e.target.value = e.target.value.toUpperCase(); });
    $("enter").addEventListener("click", async () => {
      let ok = false;
      try { ok = (await (await api("POST", "/api/admin/unlock", { password: $("password").value })).json()).ok; } catch(_e) {}
      if (!ok) { alert("Erro"); return; }
      $("gate").style.display = "none";
      $("console").style.display = "block";
      feed = new EventSource("/api/changes");
      feed.addEventListener("change", () => reload());
      feed.addEventListener("lagged", () => reload());
      reload();
    });
    $("logout").addEventListener("click", () => {
      if (feed) { feed.close(); feed = null; }
      $("console").style.display = "none";
      $("gate").style.display = "block";
    });
  })();
  </script>
</body>
</html>
"###;
